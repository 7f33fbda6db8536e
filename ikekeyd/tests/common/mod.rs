//! Shared harness: two engines wired back to back through memory
//!
//! Tasks run inline and datagrams are shuttled synchronously, so every test
//! is deterministic; time only moves when a test calls `advance`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ikekeyd::config::{ConnectionConfig, EngineConfig};
use ikekeyd::engine::Timestamp;
use ikekeyd::ifaces::{
    KernelIpsec, MemoryCertAuthority, MemoryDnsResolver, MemoryKernel, MemoryPpkStore, SaInstall,
};
use ikekeyd::impair::Impair;
use ikekeyd::{tasks, Engine};
use ikewire::definitions::params::SecurityProtocol;
use ikewire::definitions::TrafficSelector;

/// Kernel double that stays inspectable after the engine took ownership
#[derive(Clone, Default)]
pub struct SharedKernel(pub Arc<Mutex<MemoryKernel>>);

impl KernelIpsec for SharedKernel {
    fn install_sa(&mut self, install: &SaInstall) -> Result<(), ikekeyd::ifaces::KernelError> {
        self.0.lock().unwrap().install_sa(install)
    }

    fn delete_sa(&mut self, spi: u32, protocol: SecurityProtocol) {
        self.0.lock().unwrap().delete_sa(spi, protocol)
    }

    fn migrate_sa(&mut self, old_peer: SocketAddr, new_peer: SocketAddr) {
        self.0.lock().unwrap().migrate_sa(old_peer, new_peer)
    }

    fn sa_idle(&self, spi: u32) -> Option<Duration> {
        self.0.lock().unwrap().sa_idle(spi)
    }
}

pub fn addr(last: u8, port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, last)), port)
}

pub fn subnet(base: [u8; 4]) -> TrafficSelector {
    let mut end = base;
    end[3] = 255;
    TrafficSelector {
        ip_protocol: 0,
        start_port: 0,
        end_port: 65535,
        start_addr: IpAddr::V4(Ipv4Addr::from(base)),
        end_addr: IpAddr::V4(Ipv4Addr::from(end)),
    }
}

/// Two engines playing initiator (a) and responder (b) of one connection
pub struct Pair {
    pub a: Engine,
    pub b: Engine,
    pub a_kernel: SharedKernel,
    pub b_kernel: SharedKernel,
    pub a_addr: SocketAddr,
    pub b_addr: SocketAddr,
    pub now: Timestamp,
    /// Drop all datagrams instead of delivering them
    pub partitioned: bool,
}

impl Pair {
    /// A PSK pair over mirrored connection configs; the closure may bend
    /// both connections before the engines are built
    pub fn psk_with(tune: impl Fn(&mut ConnectionConfig, &mut ConnectionConfig)) -> Self {
        let a_addr = addr(1, 500);
        let b_addr = addr(2, 500);

        let mut conn_a = ConnectionConfig::psk("test", b_addr, b"hunter2");
        conn_a.local_ts = vec![subnet([10, 0, 0, 0])];
        conn_a.remote_ts = vec![subnet([10, 0, 1, 0])];

        let mut conn_b = ConnectionConfig::psk("test", a_addr, b"hunter2");
        conn_b.local_id = ikewire::definitions::Identification {
            id_type: ikewire::definitions::params::IdType::Fqdn,
            data: b"responder.local".to_vec(),
        };
        conn_b.local_ts = vec![subnet([10, 0, 1, 0])];
        conn_b.remote_ts = vec![subnet([10, 0, 0, 0])];

        tune(&mut conn_a, &mut conn_b);

        let a_kernel = SharedKernel::default();
        let b_kernel = SharedKernel::default();
        let a = build_engine(a_addr, conn_a, a_kernel.clone());
        let b = build_engine(b_addr, conn_b, b_kernel.clone());
        Self {
            a,
            b,
            a_kernel,
            b_kernel,
            a_addr,
            b_addr,
            now: Timestamp::default(),
            partitioned: false,
        }
    }

    pub fn psk() -> Self {
        Self::psk_with(|_, _| {})
    }

    /// Run tasks and shuttle datagrams until both engines go quiet
    pub fn pump(&mut self) {
        for _ in 0..256 {
            let mut progressed = false;
            for request in self.a.take_tasks() {
                let done = tasks::run(request);
                self.a.complete_task(self.now, done);
                progressed = true;
            }
            for request in self.b.take_tasks() {
                let done = tasks::run(request);
                self.b.complete_task(self.now, done);
                progressed = true;
            }
            for datagram in self.a.take_datagrams() {
                progressed = true;
                if !self.partitioned {
                    self.b.handle_datagram(self.now, self.a_addr, datagram.bytes);
                }
            }
            for datagram in self.b.take_datagrams() {
                progressed = true;
                if !self.partitioned {
                    self.a.handle_datagram(self.now, self.b_addr, datagram.bytes);
                }
            }
            if !progressed {
                return;
            }
        }
        panic!("engines never went quiet");
    }

    /// Move the clock and let timers fire, pumping after every step
    pub fn advance(&mut self, delta: Duration) {
        let target = self.now.add(delta);
        while self.now < target {
            let step = Duration::from_millis(100).min(target.since(self.now));
            self.now = self.now.add(step);
            self.a.tick(self.now);
            self.b.tick(self.now);
            self.pump();
        }
    }

    /// Establish the connection from a's side and return both IKE serials
    pub fn establish(&mut self) -> (ikekeyd::Serial, ikekeyd::Serial) {
        self.a.initiate("test").expect("initiate");
        self.pump();
        let a_ike = self.a.store().newest_ike("test").expect("a established");
        let b_ike = self.b.store().newest_ike("test").expect("b established");
        (a_ike, b_ike)
    }
}

fn build_engine(local: SocketAddr, conn: ConnectionConfig, kernel: SharedKernel) -> Engine {
    let config = EngineConfig {
        local_addr: local,
        connections: vec![conn],
        ..EngineConfig::default()
    };
    Engine::new(
        config,
        Impair::default(),
        Box::new(kernel),
        Arc::new(MemoryCertAuthority::default()),
        Box::new(MemoryPpkStore::default()),
        Arc::new(MemoryDnsResolver::default()),
    )
}
