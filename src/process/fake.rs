//! In-memory process groups for exercising launch, readiness and teardown
//! logic without forking.

use super::{ChildProcess, ProcessError, Spawner};
use crate::readiness::{HealthProbe, ProbeError};
use crate::reaper::PortReaper;
use crate::service::ServiceDescriptor;
use async_trait::async_trait;
use nix::sys::signal::Signal;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    /// Stays alive until signalled.
    Survive,
    /// Exits immediately with the given code on every attempt.
    Crash(i32),
    /// Exits immediately on the first `n` attempts, then survives.
    CrashTimes(u32),
    /// Fails before a process exists.
    SpawnError,
    /// Stays alive through SIGTERM, only SIGKILL ends it.
    IgnoreTerm,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Reaped(u16),
    Spawned { service: String, at: Instant },
    Probed { port: u16, ok: bool, at: Instant },
    Signalled { service: String, signal: Signal },
}

#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<Event>>>);

impl EventLog {
    pub fn push(&self, event: Event) {
        self.0.lock().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.lock().clone()
    }

    pub fn spawns(&self, service: &str) -> Vec<Instant> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Spawned { service: s, at } if s == service => Some(at),
                _ => None,
            })
            .collect()
    }

    pub fn signals(&self, service: &str) -> Vec<Signal> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Signalled { service: s, signal } if s == service => Some(signal),
                _ => None,
            })
            .collect()
    }

    pub fn position(&self, predicate: impl Fn(&Event) -> bool) -> Option<usize> {
        self.events().iter().position(predicate)
    }
}

#[derive(Clone)]
pub struct FakeSpawner {
    behaviors: HashMap<String, Behavior>,
    attempts: Arc<Mutex<HashMap<String, u32>>>,
    latest: Arc<Mutex<HashMap<String, Arc<Mutex<Option<i32>>>>>>,
    next_pid: Arc<AtomicU32>,
    pub log: EventLog,
}

impl FakeSpawner {
    pub fn new(log: EventLog) -> Self {
        Self {
            behaviors: HashMap::new(),
            attempts: Default::default(),
            latest: Default::default(),
            next_pid: Arc::new(AtomicU32::new(1000)),
            log,
        }
    }

    pub fn with(mut self, service: &str, behavior: Behavior) -> Self {
        self.behaviors.insert(service.to_string(), behavior);
        self
    }

    pub fn attempts(&self, service: &str) -> u32 {
        self.attempts.lock().get(service).copied().unwrap_or_default()
    }

    /// Makes the most recently spawned process of `service` exit on its own.
    pub fn exit(&self, service: &str, code: i32) {
        if let Some(gone) = self.latest.lock().get(service) {
            *gone.lock() = Some(code);
        }
    }
}

pub struct FakeChild {
    service: String,
    pid: u32,
    exit: Option<i32>,
    /// Set once the group has no members left.
    gone: Arc<Mutex<Option<i32>>>,
    ignores_term: bool,
    log: EventLog,
}

impl Spawner for FakeSpawner {
    type Child = FakeChild;

    fn spawn(&self, service: &ServiceDescriptor) -> Result<FakeChild, ProcessError> {
        let attempt = {
            let mut attempts = self.attempts.lock();
            let count = attempts.entry(service.name.clone()).or_default();
            *count += 1;
            *count
        };
        let behavior = self
            .behaviors
            .get(&service.name)
            .copied()
            .unwrap_or(Behavior::Survive);

        let exit = match behavior {
            Behavior::Survive | Behavior::IgnoreTerm => None,
            Behavior::Crash(code) => Some(code),
            Behavior::CrashTimes(n) if attempt <= n => Some(1),
            Behavior::CrashTimes(_) => None,
            Behavior::SpawnError => {
                return Err(ProcessError::Spawn {
                    command: service.command.clone(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                })
            }
        };

        self.log.push(Event::Spawned {
            service: service.name.clone(),
            at: Instant::now(),
        });
        let gone = Arc::new(Mutex::new(exit));
        self.latest
            .lock()
            .insert(service.name.clone(), gone.clone());
        Ok(FakeChild {
            service: service.name.clone(),
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
            exit: None,
            gone,
            ignores_term: matches!(behavior, Behavior::IgnoreTerm),
            log: self.log.clone(),
        })
    }
}

impl ChildProcess for FakeChild {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn try_wait(&mut self) -> Result<Option<i32>, ProcessError> {
        if self.exit.is_none() {
            self.exit = *self.gone.lock();
        }
        Ok(self.exit)
    }

    fn signal_group(&self, signal: Signal) -> Result<(), ProcessError> {
        let mut gone = self.gone.lock();
        if gone.is_some() {
            return Err(ProcessError::NoSuchProcess);
        }
        self.log.push(Event::Signalled {
            service: self.service.clone(),
            signal,
        });
        if !(self.ignores_term && signal == Signal::SIGTERM) {
            *gone = Some(128 + signal as i32);
        }
        Ok(())
    }

    fn output(&self) -> String {
        match *self.gone.lock() {
            Some(code) => format!("{} exited with {code}\n", self.service),
            None => String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Readiness {
    After(Duration),
    Hang,
}

/// Health endpoints keyed by port. Ports without an entry never answer 2xx.
pub struct FakeProbe {
    origin: Instant,
    ports: HashMap<u16, Readiness>,
    log: EventLog,
}

impl FakeProbe {
    pub fn new(log: EventLog) -> Self {
        Self {
            origin: Instant::now(),
            ports: HashMap::new(),
            log,
        }
    }

    /// Answers 2xx on `port` once `delay` has passed since construction.
    pub fn ready_after(mut self, port: u16, delay: Duration) -> Self {
        self.ports.insert(port, Readiness::After(delay));
        self
    }

    /// Requests to `port` never complete.
    pub fn hanging(mut self, port: u16) -> Self {
        self.ports.insert(port, Readiness::Hang);
        self
    }
}

fn port_of(url: &str) -> u16 {
    url.trim_start_matches("http://localhost:")
        .split('/')
        .next()
        .and_then(|p| p.parse().ok())
        .unwrap_or_default()
}

#[async_trait]
impl HealthProbe for FakeProbe {
    async fn probe(&self, url: &str, _timeout: Duration) -> Result<(), ProbeError> {
        let port = port_of(url);
        let ok = match self.ports.get(&port) {
            Some(Readiness::After(delay)) => self.origin.elapsed() >= *delay,
            Some(Readiness::Hang) => std::future::pending().await,
            None => false,
        };
        self.log.push(Event::Probed {
            port,
            ok,
            at: Instant::now(),
        });
        if ok {
            Ok(())
        } else {
            Err(ProbeError::Unhealthy(503))
        }
    }
}

pub struct FakeReaper {
    pub log: EventLog,
}

#[async_trait]
impl PortReaper for FakeReaper {
    async fn reap(&self, port: u16) {
        self.log.push(Event::Reaped(port));
    }
}
