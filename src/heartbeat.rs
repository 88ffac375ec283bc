/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Per-chain heartbeat monitors.
//!
//! The collect-tx round doubles as the leader's heartbeat: every time a follower answers a poll
//! it beats its chain's monitor. A monitor that misses beats for longer than its window publishes
//! the chain id on the shared timeout channel, which is what triggers a view change. It keeps
//! publishing once per window until it is beaten or stopped.

use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::types::basic::ChainId;

enum Command {
    Beat,
    UpdateWindow(Duration),
    Stop,
}

struct Monitor {
    sender: Sender<Command>,
    handle: Option<JoinHandle<()>>,
}

pub struct Heartbeats {
    monitors: Mutex<HashMap<ChainId, Monitor>>,
    timeout_sender: Sender<ChainId>,
}

impl Heartbeats {
    /// Creates the monitor registry and the channel on which timeouts are published.
    pub fn new() -> (Heartbeats, mpsc::Receiver<ChainId>) {
        let (timeout_sender, timeout_receiver) = mpsc::channel();
        (
            Heartbeats {
                monitors: Mutex::new(HashMap::new()),
                timeout_sender,
            },
            timeout_receiver,
        )
    }

    pub fn exists(&self, chain_id: &ChainId) -> bool {
        self.monitors.lock().unwrap().contains_key(chain_id)
    }

    /// Start a monitor with the given window. Starting an already-monitored chain only updates
    /// the window.
    pub fn start(&self, chain_id: ChainId, window: Duration) {
        let mut monitors = self.monitors.lock().unwrap();
        if let Some(monitor) = monitors.get(&chain_id) {
            let _ = monitor.sender.send(Command::UpdateWindow(window));
            return;
        }
        let (sender, receiver) = mpsc::channel();
        let timeout_sender = self.timeout_sender.clone();
        let handle = std::thread::spawn(move || {
            let mut window = window;
            loop {
                match receiver.recv_timeout(window) {
                    Ok(Command::Beat) => {}
                    Ok(Command::UpdateWindow(new_window)) => window = new_window,
                    Ok(Command::Stop) => return,
                    Err(RecvTimeoutError::Timeout) => {
                        if timeout_sender.send(chain_id).is_err() {
                            return;
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
        });
        monitors.insert(
            chain_id,
            Monitor {
                sender,
                handle: Some(handle),
            },
        );
    }

    pub fn update_window(&self, chain_id: &ChainId, window: Duration) {
        let monitors = self.monitors.lock().unwrap();
        if let Some(monitor) = monitors.get(chain_id) {
            let _ = monitor.sender.send(Command::UpdateWindow(window));
        }
    }

    /// Record a sign of leader liveness for a chain.
    pub fn beat(&self, chain_id: &ChainId) {
        let monitors = self.monitors.lock().unwrap();
        if let Some(monitor) = monitors.get(chain_id) {
            let _ = monitor.sender.send(Command::Beat);
        }
    }

    pub fn stop(&self, chain_id: &ChainId) {
        let monitor = self.monitors.lock().unwrap().remove(chain_id);
        if let Some(mut monitor) = monitor {
            let _ = monitor.sender.send(Command::Stop);
            if let Some(handle) = monitor.handle.take() {
                let _ = handle.join();
            }
        }
    }

    pub fn close_all(&self) {
        let chains: Vec<ChainId> = self.monitors.lock().unwrap().keys().cloned().collect();
        for chain in chains {
            self.stop(&chain);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn beats_keep_the_monitor_quiet() {
        let (heartbeats, timeouts) = Heartbeats::new();
        let chain = ChainId::new([1u8; 32]);
        heartbeats.start(chain, Duration::from_millis(100));

        let deadline = Instant::now() + Duration::from_millis(300);
        while Instant::now() < deadline {
            heartbeats.beat(&chain);
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(timeouts.try_recv().is_err());
        heartbeats.close_all();
    }

    #[test]
    fn missed_beats_publish_timeouts() {
        let (heartbeats, timeouts) = Heartbeats::new();
        let chain = ChainId::new([1u8; 32]);
        heartbeats.start(chain, Duration::from_millis(30));

        let got = timeouts.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(got, chain);
        // And it keeps firing until stopped.
        assert!(timeouts.recv_timeout(Duration::from_secs(2)).is_ok());
        heartbeats.stop(&chain);
    }

    #[test]
    fn stop_joins_the_monitor() {
        let (heartbeats, _timeouts) = Heartbeats::new();
        let chain = ChainId::new([1u8; 32]);
        heartbeats.start(chain, Duration::from_millis(50));
        heartbeats.stop(&chain);
        assert!(!heartbeats.exists(&chain));
    }
}
