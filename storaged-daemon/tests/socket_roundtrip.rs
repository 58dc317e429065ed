use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::task::JoinHandle;

use storaged_core::{DaemonConfig, PolicyAnswer};
use storaged_daemon::authority::StaticAuthority;
use storaged_daemon::paths::{MANAGER_INTERFACE, MANAGER_PATH};
use storaged_daemon::{
    call, request_jobs, request_objects, request_resync, request_status, request_stop, send_request,
    DaemonBuilder, DaemonError, MethodCall, MethodError, SocketPeers,
};
use storaged_sync::{EntityKind, MemorySource};

const SDA: &str = "/org/storaged/Storage/block_devices/sda";
const SDB: &str = "/org/storaged/Storage/block_devices/sdb";

struct Running {
    dir: TempDir,
    socket: PathBuf,
    source: MemorySource,
    handle: JoinHandle<Result<(), DaemonError>>,
}

fn block(device: &str) -> EntityKind {
    EntityKind::Block {
        device: device.to_string(),
        size: 1 << 30,
    }
}

async fn start(default_answer: PolicyAnswer) -> Running {
    let dir = TempDir::new().expect("tempdir");
    let dev_dir = dir.path().join("dev");
    std::fs::create_dir_all(&dev_dir).expect("dev dir");
    let config = DaemonConfig {
        persist: true,
        socket_path: dir.path().join("run/storaged.sock"),
        state_dir: dir.path().join("state"),
        dev_dir,
        ..DaemonConfig::default()
    };
    let socket = config.socket_path.clone();

    let source = MemorySource::new("memory");
    source.upsert("sda", block("/dev/sda"));

    let peers = Arc::new(SocketPeers::new());
    let daemon = DaemonBuilder::new(config)
        .source(Box::new(source.clone()))
        .authority(Some(Arc::new(StaticAuthority::new(HashMap::new(), default_answer))))
        .build(peers.clone())
        .expect("daemon builds");
    let handle = tokio::spawn(storaged_daemon::serve(daemon, peers));

    for _ in 0..100 {
        if socket.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(socket.exists(), "daemon never bound {}", socket.display());

    Running {
        dir,
        socket,
        source,
        handle,
    }
}

/// Run a blocking client call off the runtime threads.
async fn client<T, F>(socket: &Path, f: F) -> T
where
    F: FnOnce(&Path) -> T + Send + 'static,
    T: Send + 'static,
{
    let socket = socket.to_path_buf();
    tokio::task::spawn_blocking(move || f(&socket))
        .await
        .expect("client thread")
}

fn paths(objects: &Value) -> Vec<String> {
    objects
        .as_array()
        .expect("object list")
        .iter()
        .map(|o| o["path"].as_str().expect("path").to_string())
        .collect()
}

async fn stop(running: Running) {
    client(&running.socket, |s| request_stop(s))
        .await
        .expect("stop");
    let result = tokio::time::timeout(Duration::from_secs(5), running.handle)
        .await
        .expect("daemon stops")
        .expect("serve task");
    assert!(result.is_ok(), "{result:?}");
    assert!(!running.socket.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn status_objects_and_shutdown() {
    let running = start(PolicyAnswer::Yes).await;

    let status = client(&running.socket, |s| request_status(s))
        .await
        .expect("status");
    assert_eq!(status["running"], true);
    assert_eq!(status["authority"], "static");
    assert_eq!(status["liveness"]["persist"], true);

    let objects = client(&running.socket, |s| request_objects(s))
        .await
        .expect("objects");
    assert_eq!(paths(&objects), vec![SDA.to_string()]);
    assert_eq!(objects[0]["entity"]["device"], "/dev/sda");

    let jobs = client(&running.socket, |s| request_jobs(s)).await.expect("jobs");
    assert_eq!(jobs, json!([]));

    stop(running).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn resync_publishes_new_devices_once() {
    let running = start(PolicyAnswer::Yes).await;
    running.source.upsert("sdb", block("/dev/sdb"));

    let report = client(&running.socket, |s| request_resync(s))
        .await
        .expect("resync");
    assert_eq!(report["added"], json!([SDB]));

    let again = client(&running.socket, |s| request_resync(s))
        .await
        .expect("resync");
    assert_eq!(again["added"], json!([]));
    assert_eq!(again["removed"], json!([]));

    running.source.remove("sda");
    let report = client(&running.socket, |s| request_resync(s))
        .await
        .expect("resync");
    assert_eq!(report["removed"], json!([SDA]));

    stop(running).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn device_node_events_trigger_a_pass() {
    let running = start(PolicyAnswer::Yes).await;
    running.source.upsert("sdb", block("/dev/sdb"));

    let waiter = client(&running.socket, |s| {
        call(
            s,
            &MethodCall::new(MANAGER_PATH, MANAGER_INTERFACE, "WaitForObject")
                .with_args(json!({ "path": SDB, "timeout_ms": 5000 })),
        )
    });
    let touch = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(running.dir.path().join("dev/sdb"), b"").expect("create node");
    };
    let (found, ()) = tokio::join!(waiter, touch);

    assert_eq!(found.expect("object appears")["path"], SDB);
    stop(running).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn errors_cross_the_socket_by_name() {
    let running = start(PolicyAnswer::No).await;

    let denied = client(&running.socket, |s| request_objects(s))
        .await
        .unwrap_err();
    assert!(
        matches!(&denied, DaemonError::Method(MethodError::NotAuthorized(_))),
        "{denied}"
    );

    let unknown = client(&running.socket, |s| {
        send_request(s, &MethodCall::new(MANAGER_PATH, MANAGER_INTERFACE, "Explode"))
    })
    .await
    .expect("response");
    assert!(!unknown.ok);
    assert_eq!(
        unknown.error.expect("error body").name,
        "org.storaged.Error.UnknownMethod"
    );

    // Shutdown is refused as well.
    running.handle.abort();
}
