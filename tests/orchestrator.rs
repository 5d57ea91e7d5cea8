//! End-to-end orchestration against in-memory backends.

use std::sync::Arc;
use std::time::Duration;

use vpnmupd::config::{DependencySpec, default_dependencies};
use vpnmupd::installer::{Backends, Orchestrator, join_all};
use vpnmupd::service::ServiceManager;
use vpnmupd::test_utils::{
    FakeProcesses, FakeReleaseSource, FakeServiceManager, Journal, TestEnvironment, write_zip,
};

fn zip_bytes(env: &TestEnvironment, name: &str, entries: &[(&str, &[u8])]) -> Vec<u8> {
    let path = env.temp_dir.path().join(name);
    write_zip(&path, entries).unwrap();
    std::fs::read(path).unwrap()
}

/// Releases for every default dependency.
fn full_release_set(env: &TestEnvironment, journal: &Journal) -> FakeReleaseSource {
    let tun2socks = zip_bytes(
        env,
        "tun2socks.zip",
        &[("tun2socks-linux-amd64", b"tun2socks".as_slice()), ("LICENSE", b"GPL")],
    );
    let v2ray = zip_bytes(
        env,
        "v2ray.zip",
        &[
            ("v2ray", b"v2ray".as_slice()),
            ("geoip.dat", b"ip"),
            ("geosite.dat", b"site"),
            ("config.json", b"{}"),
        ],
    );

    FakeReleaseSource::default()
        .with_release(
            "xjasonlyu",
            "tun2socks",
            "v2.5.2",
            &[("tun2socks-linux-amd64.zip", "https://dl/tun2socks.zip")],
        )
        .with_release(
            "v2fly",
            "v2ray-core",
            "v5.16.1",
            &[("v2ray-linux-64.zip", "https://dl/v2ray.zip")],
        )
        .with_release(
            "cloudflare",
            "cloudflared",
            "2024.6.1",
            &[("cloudflared-linux-amd64", "https://dl/cloudflared")],
        )
        .with_release("anatolio-deb", "vpnmd", "v0.5.0", &[("vpnmd", "https://dl/vpnmd")])
        .with_release("anatolio-deb", "vpnm", "v0.4.0", &[("vpnm", "https://dl/vpnm")])
        .with_body("https://dl/tun2socks.zip", &tun2socks)
        .with_body("https://dl/v2ray.zip", &v2ray)
        .with_body("https://dl/cloudflared", b"cloudflared")
        .with_body("https://dl/vpnmd", b"vpnmd")
        .with_body("https://dl/vpnm", b"vpnm")
        .with_journal(journal.clone())
}

#[tokio::test]
async fn fresh_install_of_every_default_dependency() {
    let env = TestEnvironment::new(default_dependencies()).unwrap();
    let journal = Journal::default();
    let services = FakeServiceManager::default().with_journal(journal.clone());
    let orchestrator = Orchestrator::new(
        &env.config,
        Backends {
            releases: Arc::new(full_release_set(&env, &journal)),
            processes: Arc::new(FakeProcesses::default()),
            services: Arc::new(services.clone()),
        },
    );

    let report = orchestrator.check_all().await;
    assert!(report.failures.is_empty());
    assert_eq!(report.updatable().len(), 5);

    let installed = join_all(orchestrator.install_updatable(false).await).await.unwrap();
    assert_eq!(
        installed,
        ["tun2socks-linux-amd64", "v2ray", "cloudflared-linux-amd64", "vpnmd", "vpnm"]
    );

    for file in [
        "tun2socks-linux-amd64",
        "v2ray",
        "geoip.dat",
        "geosite.dat",
        "cloudflared-linux-amd64",
        "vpnmd",
        "vpnm",
    ] {
        assert!(env.installed(file).exists(), "{file} missing");
    }
    assert!(!env.installed("LICENSE").exists());
    assert!(!env.installed("config.json").exists());

    assert!(orchestrator.restart_service().await);
    assert!(services.is_active("vpnmd.service").await);
}

#[tokio::test]
async fn second_check_after_install_finds_nothing() {
    let env = TestEnvironment::new(vec![
        DependencySpec::new("vpnm", "anatolio-deb", "vpnm", "vpnm"),
    ])
    .unwrap();
    let journal = Journal::default();
    let processes = FakeProcesses::default().with_report("vpnm", "vpnm version 0.4.0\n");
    let orchestrator = Orchestrator::new(
        &env.config,
        Backends {
            releases: Arc::new(full_release_set(&env, &journal)),
            processes: Arc::new(processes),
            services: Arc::new(FakeServiceManager::default()),
        },
    );

    assert_eq!(orchestrator.check_all().await.updatable().len(), 1);
    join_all(orchestrator.install_updatable(false).await).await.unwrap();

    // The freshly installed binary now reports the released version.
    assert!(orchestrator.check_all().await.updatable().is_empty());
    assert!(orchestrator.updatable().await.is_empty());
}

#[tokio::test]
async fn concurrent_installs_keep_outcomes_separate() {
    let specs: Vec<DependencySpec> = (0..4)
        .map(|i| DependencySpec::new(format!("tool{i}"), "acme", format!("tool{i}"), format!("tool{i}")))
        .collect();
    let env = TestEnvironment::new(specs).unwrap();

    let mut releases = FakeReleaseSource::default().with_fetch_delay(Duration::from_millis(50));
    for i in 0..4 {
        let name = format!("tool{i}");
        let url = format!("https://dl/{name}");
        releases = releases
            .with_release("acme", &name, "v1.0.0", &[(name.as_str(), url.as_str())])
            .with_body(&url, name.as_bytes());
    }

    let orchestrator = Orchestrator::new(
        &env.config,
        Backends {
            releases: Arc::new(releases),
            processes: Arc::new(FakeProcesses::default()),
            services: Arc::new(FakeServiceManager::default()),
        },
    );
    orchestrator.check_all().await;

    let handles = orchestrator.install_updatable(false).await;
    assert_eq!(handles.len(), 4);

    let mut dependencies = Vec::new();
    for handle in handles {
        dependencies.push(handle.dependency());
        let outcomes = handle.join().await.unwrap();
        assert_eq!(outcomes.len(), 1);
    }

    for (i, shared) in dependencies.iter().enumerate() {
        let dependency = shared.lock().await;
        let name = format!("tool{i}");
        assert_eq!(dependency.outcomes().len(), 1);
        assert_eq!(dependency.outcomes()[0].file, name);
        assert_eq!(std::fs::read(env.installed(&name)).unwrap(), name.as_bytes());
    }
}

#[tokio::test]
async fn uninstall_after_install_leaves_nothing() {
    let env = TestEnvironment::new(default_dependencies()).unwrap();
    let journal = Journal::default();
    let services = FakeServiceManager::default();
    let orchestrator = Orchestrator::new(
        &env.config,
        Backends {
            releases: Arc::new(full_release_set(&env, &journal)),
            processes: Arc::new(FakeProcesses::default()),
            services: Arc::new(services.clone()),
        },
    );

    orchestrator.check_all().await;
    join_all(orchestrator.install_updatable(false).await).await.unwrap();
    orchestrator.restart_service().await;
    assert!(env.unit("vpnmd").exists());

    let removed = orchestrator.uninstall().await.unwrap();
    assert_eq!(removed.len(), 5);
    assert!(!env.unit("vpnmd").exists());
    assert!(!services.is_active("vpnmd.service").await);
    for name in removed {
        assert!(!env.installed(&name).exists());
    }
}
