#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ToastKind {
    Info,
    Success,
    Warn,
    Error,
}

impl ToastKind {
    pub fn duration_ms(self) -> u64 {
        match self {
            ToastKind::Error => 5000,
            ToastKind::Warn => 4000,
            _ => 3000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Toast {
    pub text: String,
    pub kind: ToastKind,
    pub duration_ms: u64,
}

/// Fan-out of user notifications. Live subscribers get every toast; the
/// last `cap` toasts are also kept for late readers and tests.
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Toast>,
    backlog: Arc<Mutex<VecDeque<Toast>>>,
    cap: usize,
}

impl Default for Notifier {
    fn default() -> Self { Self::new(32) }
}

impl Notifier {
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        let (tx, _) = broadcast::channel(cap);
        Self { tx, backlog: Arc::new(Mutex::new(VecDeque::with_capacity(cap))), cap }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Toast> { self.tx.subscribe() }

    pub fn toast(&self, text: impl Into<String>, kind: ToastKind) {
        let toast = Toast { text: text.into(), kind, duration_ms: kind.duration_ms() };
        debug!(kind = ?kind, text = %toast.text, "toast");
        {
            let mut q = self.backlog.lock().unwrap_or_else(|e| e.into_inner());
            if q.len() == self.cap {
                q.pop_front();
            }
            q.push_back(toast.clone());
        }
        // No receivers is fine: the backlog still has it.
        let _ = self.tx.send(toast);
    }

    pub fn success(&self, text: impl Into<String>) { self.toast(text, ToastKind::Success) }

    pub fn error(&self, text: impl Into<String>) { self.toast(text, ToastKind::Error) }

    pub fn recent(&self) -> Vec<Toast> {
        self.backlog.lock().unwrap_or_else(|e| e.into_inner()).iter().cloned().collect()
    }

    pub fn last(&self) -> Option<Toast> {
        self.backlog.lock().unwrap_or_else(|e| e.into_inner()).back().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_follow_kind() {
        let n = Notifier::new(4);
        n.error("boom");
        n.toast("careful", ToastKind::Warn);
        n.success("saved");
        let ms: Vec<u64> = n.recent().iter().map(|t| t.duration_ms).collect();
        assert_eq!(ms, vec![5000, 4000, 3000]);
    }

    #[test]
    fn backlog_is_bounded() {
        let n = Notifier::new(2);
        for i in 0..5 {
            n.toast(format!("t{i}"), ToastKind::Info);
        }
        let texts: Vec<String> = n.recent().into_iter().map(|t| t.text).collect();
        assert_eq!(texts, vec!["t3", "t4"]);
    }

    #[tokio::test]
    async fn subscribers_receive_toasts() {
        let n = Notifier::default();
        let mut rx = n.subscribe();
        n.success("Created");
        let t = rx.recv().await.unwrap();
        assert_eq!(t.kind, ToastKind::Success);
        assert_eq!(t.text, "Created");
    }
}
