// =============================================================================
// Control channel interface — the surface the engine consumes
// =============================================================================
//
// The operator-facing chat bot runs in its own process/loop and is not part
// of this crate. The engine only sees:
//   - a lock-free global trading switch,
//   - a shared read view of the symbol configuration (for dump commands),
//   - a queue of operator commands drained once per tick,
//   - a non-blocking, thread-safe notification sender.
//
// Nothing here ever blocks the control loop.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::warn;

use crate::symbols::SymbolsMap;
use crate::types::PositionSide;

/// Outbound operator notifications.
#[derive(Debug, Clone)]
pub enum Notification {
    /// A stop-loss closed a position.
    SlFilled {
        symbol: String,
        direction: PositionSide,
        quantity: Decimal,
        entry_price: Decimal,
        close_price: Decimal,
        pnl: Decimal,
        balance: Decimal,
        quote_asset: String,
    },
    /// A take-profit closed a position.
    TpFilled {
        symbol: String,
        direction: PositionSide,
        quantity: Decimal,
        entry_price: Decimal,
        close_price: Decimal,
        pnl: Decimal,
        balance: Decimal,
        quote_asset: String,
    },
    /// The stop-loss order protecting a position was replaced.
    SlUpdated {
        symbol: String,
        direction: PositionSide,
        entry_price: Decimal,
        old_sl_price: Decimal,
        new_sl_price: Decimal,
    },
    /// A live position has no active stop-loss order.
    PositionWithoutSl {
        symbol: String,
        direction: PositionSide,
        quantity: Decimal,
        entry_price: Decimal,
    },
    /// The exchange no longer reports the position but neither protective
    /// order filled.
    UnknownClosure {
        symbol: String,
        direction: PositionSide,
    },
    /// Free-form lifecycle / error notices.
    Notice { message: String },
}

/// Operator commands the engine acts on at tick boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Market-close both directional slots of a symbol and clear their state.
    ForceCloseSymbol(String),
}

/// Shared handle between the engine and the (external) control bot.
pub struct ControlHandle {
    enabled: AtomicBool,
    symbols_view: RwLock<SymbolsMap>,
    commands: Mutex<VecDeque<ControlCommand>>,
    notify_tx: mpsc::UnboundedSender<Notification>,
}

impl ControlHandle {
    /// Create the handle plus the receiving end of the notification stream
    /// (owned by whatever renders notifications — the chat bot, or a logger).
    pub fn new(enabled: bool) -> (std::sync::Arc<Self>, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            std::sync::Arc::new(Self {
                enabled: AtomicBool::new(enabled),
                symbols_view: RwLock::new(SymbolsMap::new()),
                commands: Mutex::new(VecDeque::new()),
                notify_tx: tx,
            }),
            rx,
        )
    }

    // -------------------------------------------------------------------------
    // Global switch
    // -------------------------------------------------------------------------

    /// Whether new-signal evaluation is allowed. Existing trades are managed
    /// regardless of this flag.
    pub fn is_trading_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_trading_enabled(&self, on: bool) {
        self.enabled.store(on, Ordering::Relaxed);
    }

    // -------------------------------------------------------------------------
    // Symbols view
    // -------------------------------------------------------------------------

    /// Replace the shared symbols view (called by the orchestrator after each
    /// config reload).
    pub fn publish_symbols(&self, map: SymbolsMap) {
        *self.symbols_view.write() = map;
    }

    /// Current symbols view (dump-config command).
    pub fn symbols(&self) -> SymbolsMap {
        self.symbols_view.read().clone()
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    /// Enqueue an operator command; drained at the next tick.
    pub fn push_command(&self, cmd: ControlCommand) {
        self.commands.lock().push_back(cmd);
    }

    /// Take all queued commands.
    pub fn drain_commands(&self) -> Vec<ControlCommand> {
        self.commands.lock().drain(..).collect()
    }

    // -------------------------------------------------------------------------
    // Notifications
    // -------------------------------------------------------------------------

    /// Send a notification without blocking. A closed receiver is tolerated
    /// (the engine keeps trading without an operator attached).
    pub fn notify(&self, n: Notification) {
        if self.notify_tx.send(n).is_err() {
            warn!("notification receiver dropped — message discarded");
        }
    }

    pub fn notify_notice(&self, message: impl Into<String>) {
        self.notify(Notification::Notice {
            message: message.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn switch_toggles() {
        let (handle, _rx) = ControlHandle::new(true);
        assert!(handle.is_trading_enabled());
        handle.set_trading_enabled(false);
        assert!(!handle.is_trading_enabled());
    }

    #[test]
    fn commands_drain_in_order() {
        let (handle, _rx) = ControlHandle::new(true);
        handle.push_command(ControlCommand::ForceCloseSymbol("BTCUSDT".into()));
        handle.push_command(ControlCommand::ForceCloseSymbol("ETHUSDT".into()));
        let drained = handle.drain_commands();
        assert_eq!(
            drained,
            vec![
                ControlCommand::ForceCloseSymbol("BTCUSDT".into()),
                ControlCommand::ForceCloseSymbol("ETHUSDT".into()),
            ]
        );
        assert!(handle.drain_commands().is_empty());
    }

    #[test]
    fn notify_does_not_fail_without_receiver() {
        let (handle, rx) = ControlHandle::new(true);
        drop(rx);
        // Must not panic or block.
        handle.notify_notice("engine started");
    }

    #[test]
    fn notifications_arrive() {
        let (handle, mut rx) = ControlHandle::new(true);
        handle.notify_notice("hello");
        match rx.try_recv() {
            Ok(Notification::Notice { message }) => assert_eq!(message, "hello"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
