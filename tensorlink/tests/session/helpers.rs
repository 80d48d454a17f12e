use std::net::SocketAddr;
use std::sync::Once;
use std::time::Duration;
use tensorlink::{BufferSet, ConnectionState, Session, TransportConfig};
use tracing_subscriber::EnvFilter;

/// Short timeouts so failure paths finish quickly.
pub fn fast_config() -> TransportConfig {
    TransportConfig {
        connect_timeout: Duration::from_secs(2),
        operation_timeout: Duration::from_secs(5),
        drain_timeout: Duration::from_secs(1),
        ..TransportConfig::default()
    }
}

pub fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Route transport logs through the test harness; filter with `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn session(config: TransportConfig) -> Session {
    init_tracing();
    Session::new(loopback(), config).unwrap()
}

/// Heap memory with a stable address that a session can register.
///
/// Declare buffers before the sessions using them so they are dropped last.
pub struct HostBuffer {
    ptr: *mut u8,
    len: usize,
}

// The peer writes through the registered address, never through `&self`.
unsafe impl Send for HostBuffer {}
unsafe impl Sync for HostBuffer {}

impl HostBuffer {
    pub fn zeroed(len: usize) -> Self {
        Self::from_vec(vec![0u8; len])
    }

    /// Deterministic non-zero contents, distinct per `seed`.
    pub fn pattern(len: usize, seed: u8) -> Self {
        Self::from_vec(
            (0..len)
                .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
                .collect(),
        )
    }

    fn from_vec(v: Vec<u8>) -> Self {
        let len = v.len();
        let ptr = Box::into_raw(v.into_boxed_slice()) as *mut u8;
        Self { ptr, len }
    }

    pub fn addr(&self) -> u64 {
        self.ptr as u64
    }

    pub fn len(&self) -> u64 {
        self.len as u64
    }

    pub fn to_vec(&self) -> Vec<u8> {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len).to_vec() }
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.ptr, self.len,
            )));
        }
    }
}

/// Register the whole of `buf` and return its BufferSet index.
pub fn register(session: &Session, buf: &HostBuffer) -> usize {
    unsafe { session.register_buffer(buf.addr(), 0, buf.len()).unwrap() }
}

/// Listen on `server`, connect `client` to it, and wait for both ends.
///
/// Returns the BufferSets each side received: `(server's, client's)`.
pub async fn connect_pair(server: &Session, client: &Session) -> (BufferSet, BufferSet) {
    let addr = server.listen().await.unwrap();
    let from_server = client.connect(addr).await.unwrap();
    let from_client = server.wait_established().await.unwrap();
    (from_server, from_client)
}

/// A connected `(server, client)` pair without registered memory.
pub async fn connected(config: TransportConfig) -> (Session, Session) {
    let server = session(config.clone());
    let client = session(config);
    connect_pair(&server, &client).await;
    (server, client)
}

pub async fn wait_for_state(session: &Session, state: ConnectionState) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while session.state() != state {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(
        reached.is_ok(),
        "session never reached {state}, stuck in {}",
        session.state()
    );
}
