//! Engine: order controller, position tracking and the bot orchestrator.

mod bot;
mod controller;
mod order_feed;
mod position;
mod summary;

pub use bot::{Bot, BotBuilder, LogLevel, Settings};
pub use controller::{ControllerStatus, Notifier, NotifierSubscriber, OrderController};
pub use order_feed::{OrderFeed, OrderSubscriber};
pub use position::{Position, TradeResult};
pub use summary::Summary;
