use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Account role carried in access tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Customer,
    Restaurant,
    DeliveryStaff,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Restaurant => "restaurant",
            Self::DeliveryStaff => "delivery_staff",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "customer" => Ok(Self::Customer),
            "restaurant" => Ok(Self::Restaurant),
            "delivery_staff" => Ok(Self::DeliveryStaff),
            "admin" => Ok(Self::Admin),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// Participant-pair conversation inside one order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatThread {
    #[default]
    CustomerRestaurant,
    CustomerDeliveryStaff,
    RestaurantDeliveryStaff,
}

impl ChatThread {
    pub const ALL: [ChatThread; 3] = [
        Self::CustomerRestaurant,
        Self::CustomerDeliveryStaff,
        Self::RestaurantDeliveryStaff,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CustomerRestaurant => "customer_restaurant",
            Self::CustomerDeliveryStaff => "customer_delivery_staff",
            Self::RestaurantDeliveryStaff => "restaurant_delivery_staff",
        }
    }

    /// The two roles whose order participants talk on this thread.
    pub fn member_roles(&self) -> [Role; 2] {
        match self {
            Self::CustomerRestaurant => [Role::Customer, Role::Restaurant],
            Self::CustomerDeliveryStaff => [Role::Customer, Role::DeliveryStaff],
            Self::RestaurantDeliveryStaff => [Role::Restaurant, Role::DeliveryStaff],
        }
    }
}

impl fmt::Display for ChatThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChatThread {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|thread| thread.as_str() == s)
            .ok_or_else(|| format!("unknown chat thread '{s}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Preparing,
    Ready,
    PickedUp,
    OnTheWay,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 8] = [
        Self::Pending,
        Self::Confirmed,
        Self::Preparing,
        Self::Ready,
        Self::PickedUp,
        Self::OnTheWay,
        Self::Delivered,
        Self::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Preparing => "preparing",
            Self::Ready => "ready",
            Self::PickedUp => "picked_up",
            Self::OnTheWay => "on_the_way",
            Self::Delivered => "delivered",
            Self::Cancelled => "cancelled",
        }
    }

    /// Delivered and cancelled orders never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Cancelled)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "Order placed",
            Self::Confirmed => "Order confirmed",
            Self::Preparing => "Being prepared",
            Self::Ready => "Ready for pickup",
            Self::PickedUp => "Picked up",
            Self::OnTheWay => "On the way",
            Self::Delivered => "Delivered",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown order status '{s}'"))
    }
}

/// A persisted chat message as seen by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub order_id: String,
    pub thread: ChatThread,
    pub sender_id: String,
    pub sender_name: String,
    pub sender_role: Role,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub read: bool,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    NewOrder,
    OrderStatus,
    RiderAssigned,
    NewMessage,
    ComplaintUpdate,
}

/// One-shot out-of-band update addressed to a user room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub order_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(kind: NotificationKind, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            title: title.into(),
            message: message.into(),
            order_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn for_order(mut self, order_id: impl Into<String>) -> Self {
        self.order_id = Some(order_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_names_round_trip_through_from_str() {
        for thread in ChatThread::ALL {
            assert_eq!(thread.as_str().parse::<ChatThread>(), Ok(thread));
        }
        assert!("customer_admin".parse::<ChatThread>().is_err());
    }

    #[test]
    fn default_thread_is_customer_restaurant() {
        assert_eq!(ChatThread::default(), ChatThread::CustomerRestaurant);
    }

    #[test]
    fn only_delivered_and_cancelled_are_terminal() {
        let terminal: Vec<_> = OrderStatus::ALL
            .into_iter()
            .filter(OrderStatus::is_terminal)
            .collect();
        assert_eq!(terminal, vec![OrderStatus::Delivered, OrderStatus::Cancelled]);
    }

    #[test]
    fn role_serde_uses_snake_case() {
        let json = serde_json::to_string(&Role::DeliveryStaff).unwrap();
        assert_eq!(json, "\"delivery_staff\"");
        assert_eq!("delivery_staff".parse::<Role>(), Ok(Role::DeliveryStaff));
    }
}
