//! Worker threads
//!
//! Each worker runs one loop over the networks it hosts: drain commands,
//! poll for readiness, and tick timers once per `tick_interval`. The networks
//! are built on the worker thread itself and never leave it.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::affinity;
use crate::config::NetConfig;
use crate::event::{Command, NetType, Notice};
use crate::network::{self, Network};
use crate::queue::{Consumer, Producer};

/// Commands handled per network per loop iteration, so that one busy
/// producer cannot starve polling.
const COMMAND_BUDGET: usize = 1024;

/// The worker's ends of one network's queues.
pub struct WorkerLink {
    pub net: NetType,
    pub commands: Consumer<Command>,
    pub notices: Producer<Notice>,
}

/// Spawns worker `index` as thread `horizon-net-worker-{index}`.
pub fn spawn(
    index: u8,
    config: Arc<NetConfig>,
    links: Vec<WorkerLink>,
    stop: Arc<AtomicBool>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("horizon-net-worker-{}", index))
        .spawn(move || run(index, &config, links, &stop))
}

fn run(index: u8, config: &Arc<NetConfig>, links: Vec<WorkerLink>, stop: &AtomicBool) {
    if let Some(cpu) = affinity::worker_cpu(&config.worker_cpus, index as usize) {
        match affinity::pin_to_cpu(cpu) {
            Ok(()) => log::debug!("worker {} pinned to cpu {}", index, cpu),
            Err(e) => log::warn!("worker {}: pinning to cpu {} failed: {}", index, cpu, e),
        }
    }

    let mut networks: Vec<Box<dyn Network>> = Vec::with_capacity(links.len());
    for link in links {
        match network::build(link.net, index, config.clone(), link.commands, link.notices) {
            Ok(net) => networks.push(net),
            Err(e) => log::error!("worker {}: {} network unavailable: {}", index, link.net.name(), e),
        }
    }
    if networks.is_empty() {
        return;
    }

    let slice = poll_slice(config.poll_timeout, networks.len());
    log::debug!("worker {} running {} network(s), poll slice {:?}", index, networks.len(), slice);

    let mut last_tick = Instant::now();
    while !stop.load(Ordering::Acquire) {
        for net in networks.iter_mut() {
            net.drain_commands(COMMAND_BUDGET);
            if let Err(e) = net.poll(slice) {
                log::error!("worker {}: {} poll failed: {}", index, net.net_type().name(), e);
                thread::sleep(slice);
            }
        }
        let now = Instant::now();
        if now.saturating_duration_since(last_tick) >= config.tick_interval {
            for net in networks.iter_mut() {
                net.tick(now);
            }
            last_tick = now;
        }
    }

    for net in networks.iter_mut() {
        net.shutdown();
    }
    log::debug!("worker {} stopped", index);
}

/// Per-network share of one loop iteration's wait, at least 1ms.
fn poll_slice(total: Duration, networks: usize) -> Duration {
    let n = networks.max(1) as u32;
    (total / n).max(Duration::from_millis(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn_id::ConnectionId;
    use crate::error::NetError;
    use crate::event::Endpoint;
    use crate::queue::spsc;

    #[test]
    fn test_poll_slice() {
        assert_eq!(poll_slice(Duration::from_millis(9), 3), Duration::from_millis(3));
        assert_eq!(poll_slice(Duration::from_millis(2), 3), Duration::from_millis(1));
        assert_eq!(poll_slice(Duration::ZERO, 0), Duration::from_millis(1));
    }

    #[test]
    fn test_worker_serves_commands_and_stops() {
        let config = Arc::new(NetConfig { networks: vec![NetType::Tcp], ..NetConfig::default() });
        let (mut commands, cmd_rx) = spsc(16);
        let (notice_tx, mut notices) = spsc(16);
        let stop = Arc::new(AtomicBool::new(false));
        let link = WorkerLink { net: NetType::Tcp, commands: cmd_rx, notices: notice_tx };
        let handle = spawn(3, config, vec![link], stop.clone()).unwrap();

        let endpoint = Endpoint { addr: "127.0.0.1:1".parse().unwrap(), send_buf: 0, recv_buf: 0 };
        commands.push(Command::Connect { opaque: 11, endpoint }).unwrap();
        commands.push(Command::Close { conn_id: ConnectionId::new(0, 3, 0) }).unwrap();

        let deadline = Instant::now() + Duration::from_secs(3);
        let notice = loop {
            if let Some(n) = notices.pop() {
                break n;
            }
            assert!(Instant::now() < deadline, "no notice from worker");
            thread::sleep(Duration::from_millis(2));
        };
        // refused by the OS or cancelled by the close; both end the same way
        assert!(matches!(notice, Notice::ConnectFailed { opaque: 11, .. }));
        if let Notice::ConnectFailed { code, .. } = notice {
            assert_ne!(code, NetError::AllocFailed);
        }

        stop.store(true, Ordering::Release);
        handle.join().unwrap();
    }
}
