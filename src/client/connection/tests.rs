use super::*;
use crate::client::spawn::{InProcess, SpawnedService};
use crate::readiness::ReadinessReceiver;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::io::duplex;
use tokio::net::TcpListener;
use tokio::time::timeout;

/// Returns a loopback address nothing is listening on.
async fn free_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

fn config(addr: SocketAddr) -> ServiceConfig {
    ServiceConfig::new(addr, Duration::from_secs(5))
}

/// Counts spawn calls before delegating.
#[derive(Clone, Default)]
struct CountingSpawner {
    calls: Arc<AtomicUsize>,
}

impl ServiceSpawner for CountingSpawner {
    fn spawn(&self, config: &ServiceConfig) -> io::Result<SpawnedService> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        InProcess.spawn(config)
    }
}

struct FailingSpawner;

impl ServiceSpawner for FailingSpawner {
    fn spawn(&self, _config: &ServiceConfig) -> io::Result<SpawnedService> {
        Err(io::Error::new(io::ErrorKind::NotFound, "no such binary"))
    }
}

/// Fails to spawn, but a rival grabs the address in the meantime.
#[derive(Default)]
struct RivalSpawner {
    rival: Mutex<Option<std::net::TcpListener>>,
}

impl ServiceSpawner for RivalSpawner {
    fn spawn(&self, config: &ServiceConfig) -> io::Result<SpawnedService> {
        let listener = std::net::TcpListener::bind(config.addr)?;
        *self.rival.lock().unwrap() = Some(listener);
        Err(io::Error::new(io::ErrorKind::PermissionDenied, "not allowed"))
    }
}

/// Starts something that never reports readiness.
struct SilentSpawner;

impl ServiceSpawner for SilentSpawner {
    fn spawn(&self, _config: &ServiceConfig) -> io::Result<SpawnedService> {
        let (service_end, launcher_end) = duplex(64);
        let handle = tokio::spawn(async move {
            let _keep_open = service_end;
            std::future::pending::<()>().await;
        });
        Ok(SpawnedService::task(
            handle,
            ReadinessReceiver::new(BufReader::new(launcher_end)),
        ))
    }
}

#[test]
fn test_start_error_display() {
    let err = StartError::Spawn(io::Error::new(io::ErrorKind::NotFound, "missing"));
    assert_eq!(err.to_string(), "failed to spawn service");
    assert!(std::error::Error::source(&err).is_some());
    assert!(!err.is_bind_conflict());

    let err = StartError::from(ReadinessError::Closed);
    assert_eq!(err.to_string(), "service exited before reporting readiness");
}

#[test]
fn test_start_error_bind_conflict() {
    let err = StartError::from(ReadinessError::Failed(
        "address in use: Address already in use (os error 98)".to_string(),
    ));
    assert!(err.is_bind_conflict());
}

#[test]
fn test_client_error_display() {
    assert_eq!(
        ClientError::Closed.to_string(),
        "service closed the connection"
    );
    let err = ClientError::Rejected("invalid request".to_string());
    assert!(err.to_string().contains("invalid request"));
}

#[test]
fn test_errors_are_send_sync() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<ClientError>();
    assert_send_sync::<StartError>();
}

#[tokio::test]
async fn test_cold_start_in_process() {
    let addr = free_addr().await;
    let launcher = Launcher::with_spawner(config(addr), InProcess);

    let bootstrap = launcher.connect_or_start().await;
    assert!(matches!(bootstrap.startup, Startup::Ready));
    assert!(bootstrap.spawned());

    let mut client = bootstrap.into_client().expect("should be connected");
    assert_eq!(client.version().await.unwrap(), crate::protocol::VERSION);
    assert_eq!(client.request_count().await.unwrap(), 2);
    assert_eq!(client.peer_addr().unwrap(), addr);
}

#[tokio::test]
async fn test_running_service_is_reused_without_spawning() {
    let addr = free_addr().await;
    let first = Launcher::with_spawner(config(addr), InProcess)
        .connect_or_start()
        .await;
    assert!(first.is_connected());

    let spawner = CountingSpawner::default();
    let calls = Arc::clone(&spawner.calls);
    let second = Launcher::with_spawner(config(addr), spawner)
        .connect_or_start()
        .await;

    assert!(second.is_connected());
    assert!(matches!(second.startup, Startup::NotNeeded));
    assert!(!second.spawned());
    assert_eq!(calls.load(Ordering::SeqCst), 0, "no spawn should be attempted");
}

#[tokio::test]
async fn test_spawn_failure_degrades_without_error() {
    let addr = free_addr().await;
    let bootstrap = Launcher::with_spawner(config(addr), FailingSpawner)
        .connect_or_start()
        .await;

    assert!(!bootstrap.is_connected());
    assert!(matches!(bootstrap.startup, Startup::Failed(StartError::Spawn(_))));
}

#[tokio::test]
async fn test_spawn_failure_still_retries_connection() {
    let addr = free_addr().await;
    let bootstrap = Launcher::with_spawner(config(addr), RivalSpawner::default())
        .connect_or_start()
        .await;

    assert!(
        bootstrap.is_connected(),
        "retry should reach the service started by someone else"
    );
    assert!(matches!(bootstrap.startup, Startup::Failed(StartError::Spawn(_))));
}

#[tokio::test]
async fn test_silent_service_times_out() {
    let addr = free_addr().await;
    let launcher = Launcher::with_spawner(config(addr), SilentSpawner)
        .ready_timeout(Duration::from_millis(50));

    let start = Instant::now();
    let bootstrap = timeout(Duration::from_secs(2), launcher.connect_or_start())
        .await
        .expect("bootstrap must not hang on a silent service");

    assert!(start.elapsed() >= Duration::from_millis(50));
    assert!(!bootstrap.is_connected());
    assert!(matches!(
        bootstrap.startup,
        Startup::Failed(StartError::Readiness(ReadinessError::TimedOut(_)))
    ));
}

#[tokio::test]
async fn test_client_surfaces_error_response() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut stream = BufReader::new(stream);
        let mut line = String::new();
        stream.read_line(&mut line).await.unwrap();
        stream
            .write_all(b"{\"result\":\"error\",\"message\":\"busy\"}\n")
            .await
            .unwrap();
    });

    let mut client = Client::connect(addr).await.unwrap();
    let err = client.version().await.unwrap_err();
    assert!(matches!(err, ClientError::Rejected(ref m) if m == "busy"));
    server.await.unwrap();
}

#[tokio::test]
async fn test_client_detects_closed_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        drop(stream);
    });

    let mut client = Client::connect(addr).await.unwrap();
    server.await.unwrap();
    let err = client.request_count().await.unwrap_err();
    assert!(matches!(err, ClientError::Closed | ClientError::Io(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_cold_start_converges_on_one_service() {
    const LAUNCHERS: usize = 8;
    let addr = free_addr().await;

    let mut handles = Vec::new();
    for _ in 0..LAUNCHERS {
        handles.push(tokio::spawn(async move {
            let bootstrap = Launcher::with_spawner(config(addr), InProcess)
                .connect_or_start()
                .await;
            let ready = matches!(bootstrap.startup, Startup::Ready);
            if let Startup::Failed(e) = &bootstrap.startup {
                assert!(e.is_bind_conflict(), "unexpected startup failure: {e}");
            }
            let mut client = bootstrap.into_client().expect("every launcher should connect");
            let count = client.request_count().await.unwrap();
            (ready, count)
        }));
    }

    let mut ready = 0;
    let mut counts = HashSet::new();
    for handle in handles {
        let (was_ready, count) = timeout(Duration::from_secs(5), handle)
            .await
            .expect("launcher hung")
            .unwrap();
        ready += usize::from(was_ready);
        counts.insert(count);
    }

    assert_eq!(ready, 1, "exactly one spawned service should report ready");
    // One shared counter means every launcher saw a distinct value.
    let expected: HashSet<u64> = (1..=LAUNCHERS as u64).collect();
    assert_eq!(counts, expected);
}
