//! Polling fallback for order status while the socket is not ready.

use std::time::Duration;

use khanasathi_proto::{OrderStatus, ServerEvent};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::connection::ConnectionState;
use crate::rest::ApiClient;
use crate::subscription::Subscribers;

/// Shortest gap between polls; `tokio::time::interval` rejects zero.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Polls one order at a fixed interval whenever the realtime connection is
/// not `Ready`, and feeds status changes to subscribers as
/// `orderStatusUpdate` events. Stops when dropped.
pub struct OrderPoller {
    task: JoinHandle<()>,
}

impl OrderPoller {
    pub fn spawn(
        api: ApiClient,
        order_id: impl Into<String>,
        interval: Duration,
        state: watch::Receiver<ConnectionState>,
        subscribers: Subscribers,
    ) -> Self {
        let order_id = order_id.into();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(MIN_POLL_INTERVAL));
            let mut last_seen: Option<OrderStatus> = None;
            loop {
                ticker.tick().await;
                if *state.borrow() == ConnectionState::Ready {
                    continue;
                }

                let order = match api.get_order(&order_id).await {
                    Ok(order) => order,
                    Err(e) => {
                        tracing::debug!(order_id = %order_id, error = %e, "Order poll failed");
                        continue;
                    }
                };
                if last_seen == Some(order.status) {
                    continue;
                }
                last_seen = Some(order.status);
                subscribers.dispatch(&ServerEvent::OrderStatusUpdate {
                    order_id: order.id,
                    status: order.status,
                    updated_at: order.updated_at,
                });
                if order.status.is_terminal() {
                    tracing::debug!(order_id = %order_id, "Order finished, polling stopped");
                    break;
                }
            }
        });
        Self { task }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for OrderPoller {
    fn drop(&mut self) {
        self.task.abort();
    }
}
