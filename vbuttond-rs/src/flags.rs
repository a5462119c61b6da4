/* Shared status bit group ("event flags") with set/clear/wait semantics.
 *
 * Backed by a `watch` channel so waiters are woken on every change and a
 * snapshot read never blocks. */

use std::sync::Arc;

use tokio::sync::watch;

/* Set while a configuration is fully installed; cleared for the duration of a switch. */
pub const CONFIG_STABLE: u32 = 1 << 0;
/* Set while no external command batch is being processed. */
pub const CMD_QUEUE_IDLE: u32 = 1 << 1;
/* Route HID commands to the USB transport. */
pub const ROUTE_USB: u32 = 1 << 2;
/* Route HID commands to the BLE transport. */
pub const ROUTE_BLE: u32 = 1 << 3;

/* Both bits must be present before any action may fire. */
pub const DISPATCH_GATE: u32 = CONFIG_STABLE | CMD_QUEUE_IDLE;

#[derive(Clone)]
pub struct EventFlags {
    tx: Arc<watch::Sender<u32>>,
}

impl EventFlags {
    pub fn new(initial: u32) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn set(&self, bits: u32) {
        self.tx.send_modify(|flags| *flags |= bits);
    }

    pub fn clear(&self, bits: u32) {
        self.tx.send_modify(|flags| *flags &= !bits);
    }

    /* Set or clear `bits` depending on `on`. */
    pub fn assign(&self, bits: u32, on: bool) {
        if on {
            self.set(bits);
        } else {
            self.clear(bits);
        }
    }

    pub fn get(&self) -> u32 {
        *self.tx.borrow()
    }

    pub fn all_set(&self, bits: u32) -> bool {
        self.get() & bits == bits
    }

    pub fn subscribe(&self) -> watch::Receiver<u32> {
        self.tx.subscribe()
    }

    /* Wait until every bit in `bits` is set. */
    pub async fn wait_all(&self, bits: u32) {
        let mut rx = self.subscribe();
        loop {
            if *rx.borrow_and_update() & bits == bits {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
