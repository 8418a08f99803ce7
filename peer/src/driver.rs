//! Transport driver.
//!
//! Bridges one [`RaceEngine`] to the room channel: decodes inbound
//! broadcasts, feeds presence snapshots, fires the engine's timers, and
//! drains its outbox back onto the channel. The engine itself stays
//! synchronous; everything async lives here.

use crate::bus::{BusHandle, MemoryBus};
use engine::{Outbound, RaceEngine};
use log::warn;
use protocol::RaceEvent;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::interval;

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

pub struct PeerDriver {
    engine: RaceEngine,
    handle: BusHandle,
}

impl PeerDriver {
    pub fn new(engine: RaceEngine, bus: &MemoryBus) -> Self {
        let handle = bus.subscribe(engine.peer_id());
        Self { engine, handle }
    }

    /// Subscribes the engine onto the channel and announces presence.
    pub fn connect(&mut self, now: u64) {
        self.engine.connect();
        // The in-memory channel cannot refuse a subscription.
        self.engine.on_subscribed(now);
        self.flush();
    }

    /// One synchronization step: inbound events, presence, timers, outbox.
    pub fn pump(&mut self, now: u64) {
        for payload in self.handle.poll() {
            match RaceEvent::decode(&payload) {
                Some(event) => self.engine.handle_event(event, now),
                None => warn!("dropping malformed broadcast payload"),
            }
        }
        let snapshot = self.handle.snapshot();
        self.engine.handle_presence(&snapshot, now);
        self.engine.tick(now);
        self.flush();
    }

    fn flush(&mut self) {
        for out in self.engine.drain_outbox() {
            match out {
                Outbound::Broadcast(event) => self.handle.publish(event.encode()),
                Outbound::Presence(record) => self.handle.set_presence(record),
            }
        }
    }

    /// Pumps on a fixed cadence until `done` returns true.
    pub async fn run_until<F>(&mut self, mut done: F)
    where
        F: FnMut(&RaceEngine) -> bool,
    {
        let mut pump_interval = interval(Duration::from_millis(50));
        loop {
            pump_interval.tick().await;
            self.pump(now_ms());
            if done(&self.engine) {
                break;
            }
        }
    }

    pub fn leave(&mut self) {
        self.engine.leave();
        self.handle.leave();
    }

    pub fn engine(&self) -> &RaceEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut RaceEngine {
        &mut self.engine
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::{JoinIntent, MemoryStore};
    use protocol::RacePhase;

    fn pump_all(drivers: &mut [&mut PeerDriver], now: u64) {
        // Twice, so replies to freshly-delivered events land too.
        for _ in 0..2 {
            for d in drivers.iter_mut() {
                d.pump(now);
            }
        }
    }

    #[test]
    fn test_two_peers_converge_through_the_bus() {
        let bus = MemoryBus::new();
        let host_engine =
            RaceEngine::create("room-1", "office", "alice", Box::new(MemoryStore::new()));
        let key = host_engine.join_key().unwrap().to_string();
        let mut host = PeerDriver::new(host_engine, &bus);
        host.connect(0);

        let joiner_engine = RaceEngine::join(
            JoinIntent::racer("room-1", "bob", key),
            Box::new(MemoryStore::new()),
        );
        let mut joiner = PeerDriver::new(joiner_engine, &bus);
        joiner.connect(0);

        pump_all(&mut [&mut host, &mut joiner], 10);

        assert_eq!(host.engine().members().len(), 2);
        assert_eq!(joiner.engine().members().len(), 2);
        assert!(!joiner.engine().self_member().unwrap().is_spectator);
        assert_eq!(joiner.engine().room_name(), "office");
    }

    #[test]
    fn test_ready_update_crosses_the_bus() {
        let bus = MemoryBus::new();
        let host_engine =
            RaceEngine::create("room-1", "office", "alice", Box::new(MemoryStore::new()));
        let key = host_engine.join_key().unwrap().to_string();
        let mut host = PeerDriver::new(host_engine, &bus);
        host.connect(0);

        let joiner_engine = RaceEngine::join(
            JoinIntent::racer("room-1", "bob", key),
            Box::new(MemoryStore::new()),
        );
        let mut joiner = PeerDriver::new(joiner_engine, &bus);
        joiner.connect(0);
        pump_all(&mut [&mut host, &mut joiner], 10);

        joiner.engine_mut().set_ready(true, 20).unwrap();
        pump_all(&mut [&mut host, &mut joiner], 20);

        let joiner_id = joiner.engine().peer_id().to_string();
        assert!(host.engine().members()[&joiner_id].ready);
    }

    #[tokio::test]
    async fn test_run_until_drains_inbound_broadcasts() {
        let bus = MemoryBus::new();
        let host_engine =
            RaceEngine::create("room-1", "office", "alice", Box::new(MemoryStore::new()));
        let mut host = PeerDriver::new(host_engine, &bus);
        host.connect(0);

        let other = bus.subscribe("zz-raw-peer");
        other.publish(
            RaceEvent::Chat(protocol::ChatMessage {
                id: "m-1".to_string(),
                sender_id: "zz-raw-peer".to_string(),
                sender_name: "carol".to_string(),
                text: "anyone up for a round?".to_string(),
                sent_at_ms: 5,
            })
            .encode(),
        );

        host.run_until(|e| e.chat().messages().count() == 1).await;
        let msg = host.engine().chat().messages().next().unwrap();
        assert_eq!(msg.text, "anyone up for a round?");
    }

    #[test]
    fn test_dropped_peer_disappears_from_snapshot() {
        let bus = MemoryBus::new();
        let host_engine =
            RaceEngine::create("room-1", "office", "alice", Box::new(MemoryStore::new()));
        let key = host_engine.join_key().unwrap().to_string();
        let mut host = PeerDriver::new(host_engine, &bus);
        host.connect(0);

        let joiner_engine = RaceEngine::join(
            JoinIntent::racer("room-1", "bob", key),
            Box::new(MemoryStore::new()),
        );
        let joiner_id = joiner_engine.peer_id().to_string();
        let mut joiner = PeerDriver::new(joiner_engine, &bus);
        joiner.connect(0);
        pump_all(&mut [&mut host, &mut joiner], 10);
        assert!(host.engine().members().contains_key(&joiner_id));

        bus.drop_peer(&joiner_id);
        host.pump(20);
        assert_eq!(host.engine().phase(), RacePhase::Waiting);
        assert!(!host.engine().members().contains_key(&joiner_id));
    }
}
