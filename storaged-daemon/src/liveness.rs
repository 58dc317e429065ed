//! Client and job counting for on-demand exit.
//!
//! A non-persistent daemon may exit once it has no known clients and no
//! running jobs. Counts only move through the methods below; observers get
//! every change through a watch channel.

use serde::Serialize;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Quiescence {
    pub persist: bool,
    pub clients: usize,
    pub jobs: usize,
}

impl Quiescence {
    pub fn may_exit(&self) -> bool {
        !self.persist && self.clients == 0 && self.jobs == 0
    }
}

#[derive(Debug)]
pub struct Liveness {
    state: watch::Sender<Quiescence>,
}

impl Liveness {
    pub fn new(persist: bool) -> Self {
        let (state, _) = watch::channel(Quiescence {
            persist,
            clients: 0,
            jobs: 0,
        });
        Self { state }
    }

    pub fn client_appeared(&self) {
        self.state.send_modify(|q| q.clients += 1);
    }

    pub fn client_disappeared(&self) {
        self.state.send_modify(|q| {
            debug_assert!(q.clients > 0, "client count underflow");
            q.clients = q.clients.saturating_sub(1);
        });
    }

    pub fn job_started(&self) {
        self.state.send_modify(|q| q.jobs += 1);
    }

    pub fn job_finished(&self) {
        self.state.send_modify(|q| {
            debug_assert!(q.jobs > 0, "job count underflow");
            q.jobs = q.jobs.saturating_sub(1);
        });
    }

    pub fn snapshot(&self) -> Quiescence {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Quiescence> {
        self.state.subscribe()
    }
}
