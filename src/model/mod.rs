pub mod alert;
pub mod bar;
pub mod book;
pub mod market;
pub mod tick;

pub use alert::{AlertDirection, PriceAlert};
pub use bar::{floor_time, Bar};
pub use book::{BookLevel, OrderBook};
pub use market::{Market, MarketType};
pub use tick::{Tick, TickSnapshot, TickUpdate, Trade, TradeSide};
