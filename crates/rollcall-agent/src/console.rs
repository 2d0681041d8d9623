//! Console output contract.
//!
//! The agent prints one line when its registration succeeds and one line
//! per membership event. Diagnostics go through `tracing`; only these
//! lines go to the console sink.

use std::fmt::Display;
use std::io::{Stdout, Write};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::warn;

use crate::watcher::MembershipEvent;

/// Shared line-oriented output sink.
#[derive(Debug)]
pub struct Console<W> {
    out: Arc<Mutex<W>>,
}

impl<W> Clone for Console<W> {
    fn clone(&self) -> Self {
        Self {
            out: Arc::clone(&self.out),
        }
    }
}

impl<W: Write> Console<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Arc::new(Mutex::new(out)),
        }
    }

    /// Write one line and flush it.
    pub fn line(&self, msg: impl Display) {
        let mut out = self.lock();
        if let Err(e) = writeln!(out, "{msg}").and_then(|_| out.flush()) {
            warn!(error = %e, "failed to write console line");
        }
    }

    fn lock(&self) -> MutexGuard<'_, W> {
        match self.out.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Console<Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl Console<Vec<u8>> {
    /// In-memory console, for inspecting output.
    pub fn buffer() -> Self {
        Self::new(Vec::new())
    }

    /// Lines written so far.
    pub fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.lock())
            .lines()
            .map(str::to_string)
            .collect()
    }
}

/// Print membership events until the watcher drops its sender.
pub async fn present<W: Write>(mut events: mpsc::Receiver<MembershipEvent>, console: Console<W>) {
    while let Some(event) = events.recv().await {
        console.line(&event);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use rollcall_catalog::{CheckStatus, MemberEntry};

    use super::*;

    fn member(id: &str) -> MemberEntry {
        MemberEntry {
            service: "mycluster".to_string(),
            id: id.to_string(),
            node: "memory".to_string(),
            address: "10.0.0.5".to_string(),
            port: 9001,
            tags: BTreeSet::from(["login".to_string()]),
            status: CheckStatus::Passing,
        }
    }

    #[test]
    fn buffer_collects_lines() {
        let console = Console::buffer();
        console.line("service registered: svc_1 (mycluster) at 127.0.0.1:1");
        console.clone().line("second");

        assert_eq!(
            console.lines(),
            vec![
                "service registered: svc_1 (mycluster) at 127.0.0.1:1".to_string(),
                "second".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn present_prints_each_event_until_closed() {
        let console = Console::buffer();
        let (tx, rx) = mpsc::channel(8);

        tx.send(MembershipEvent::Observed(member("a"))).await.unwrap();
        tx.send(MembershipEvent::Left(member("b"))).await.unwrap();
        drop(tx);

        present(rx, console.clone()).await;

        assert_eq!(
            console.lines(),
            vec![
                "member observed: mycluster/a 10.0.0.5:9001 [login] passing".to_string(),
                "member left: mycluster/b 10.0.0.5:9001 [login] passing".to_string(),
            ]
        );
    }
}
