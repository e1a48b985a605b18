// This file is part of Vigil VRS, a multi-camera video recording supervisor.
// Copyright (C) 2024 The Vigil VRS Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Shutdown propagation and camera enable flags.
//!
//! Three pieces that the per-camera driver loops compose:
//!
//! * [`channel`]: a graceful-shutdown pair. Dropping the [`Sender`] requests
//!   shutdown; [`Receiver`]s can be cloned, polled with [`Receiver::check`],
//!   or awaited.
//! * [`Flag`]: a settable/clearable boolean (record enabled, watch enabled)
//!   whose subscribers wake on every transition in either direction.
//! * [`AnyChange`]: a composite wait over a shutdown receiver and any number
//!   of flags, returning *why* it woke.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::watch;

#[derive(Debug)]
pub struct ShutdownError;

impl fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("shutdown requested")
    }
}

impl std::error::Error for ShutdownError {}

/// Requests shutdown on drop.
pub struct Sender(#[allow(dead_code)] watch::Sender<()>);

/// Observes the shutdown request.
#[derive(Clone)]
pub struct Receiver(watch::Receiver<()>);

impl Receiver {
    /// Returns an error iff shutdown has been requested.
    pub fn check(&self) -> Result<(), ShutdownError> {
        if self.0.has_changed().is_err() {
            Err(ShutdownError)
        } else {
            Ok(())
        }
    }

    /// Completes when shutdown is requested.
    pub async fn recv(&mut self) {
        // The sender never sends a value, so `changed` can only resolve with
        // the closed error.
        while self.0.changed().await.is_ok() {}
    }
}

/// Returns a sender and receiver for graceful shutdown.
pub fn channel() -> (Sender, Receiver) {
    let (tx, rx) = watch::channel(());
    (Sender(tx), Receiver(rx))
}

/// A clonable boolean whose subscribers wake on set↔cleared transitions.
#[derive(Clone)]
pub struct Flag(Arc<watch::Sender<bool>>);

impl Flag {
    pub fn new(initial: bool) -> Self {
        Flag(Arc::new(watch::channel(initial).0))
    }

    pub fn set(&self) {
        self.0.send_if_modified(|v| !std::mem::replace(v, true));
    }

    pub fn clear(&self) {
        self.0.send_if_modified(|v| std::mem::replace(v, false));
    }

    pub fn is_set(&self) -> bool {
        *self.0.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.0.subscribe()
    }
}

/// Why an [`AnyChange::wait`] returned.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WaitReason {
    /// Some flag transitioned set↔cleared.
    Changed,
    /// Shutdown was requested.
    Shutdown,
    /// The timeout elapsed first.
    TimedOut,
}

/// A composite wait over shutdown plus flag transitions.
///
/// Subscriptions are taken at construction; a transition between two waits is
/// still reported by the next `wait` call, so loops can't miss an edge.
pub struct AnyChange {
    shutdown: Receiver,
    flags: Vec<watch::Receiver<bool>>,
}

impl AnyChange {
    pub fn new(shutdown: Receiver, flags: &[&Flag]) -> Self {
        AnyChange {
            shutdown,
            flags: flags.iter().map(|f| f.subscribe()).collect(),
        }
    }

    /// Waits until any input transitions, shutdown is requested, or `timeout`
    /// elapses, whichever comes first.
    pub async fn wait(&mut self, timeout: Duration) -> WaitReason {
        let mut changed: FuturesUnordered<_> =
            self.flags.iter_mut().map(|rx| rx.changed()).collect();
        tokio::select! {
            _ = self.shutdown.recv() => WaitReason::Shutdown,
            Some(_) = changed.next() => WaitReason::Changed,
            _ = tokio::time::sleep(timeout) => WaitReason::TimedOut,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check() {
        let (tx, rx) = channel();
        rx.check().unwrap();
        drop(tx);
        rx.check().unwrap_err();
    }

    #[tokio::test]
    async fn recv_wakes_on_drop() {
        let (tx, mut rx) = channel();
        let h = tokio::spawn(async move { rx.recv().await });
        drop(tx);
        h.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn wait_reports_timeout() {
        let (_tx, rx) = channel();
        let record = Flag::new(false);
        let mut any = AnyChange::new(rx, &[&record]);
        assert_eq!(any.wait(Duration::from_secs(5)).await, WaitReason::TimedOut);
    }

    #[tokio::test]
    async fn wait_reports_flag_edges_both_ways() {
        let (_tx, rx) = channel();
        let record = Flag::new(false);
        let watch = Flag::new(true);
        let mut any = AnyChange::new(rx, &[&record, &watch]);

        record.set();
        assert_eq!(
            any.wait(Duration::from_secs(10)).await,
            WaitReason::Changed
        );
        watch.clear();
        assert_eq!(
            any.wait(Duration::from_secs(10)).await,
            WaitReason::Changed
        );
    }

    #[tokio::test]
    async fn redundant_set_does_not_wake() {
        let (_tx, rx) = channel();
        let record = Flag::new(true);
        let mut any = AnyChange::new(rx, &[&record]);
        record.set(); // already set; no transition
        assert_eq!(
            any.wait(Duration::from_millis(10)).await,
            WaitReason::TimedOut
        );
    }

    #[tokio::test]
    async fn wait_reports_shutdown() {
        let (tx, rx) = channel();
        let record = Flag::new(false);
        let mut any = AnyChange::new(rx, &[&record]);
        drop(tx);
        assert_eq!(
            any.wait(Duration::from_secs(10)).await,
            WaitReason::Shutdown
        );
    }
}
