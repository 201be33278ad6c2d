// Live candle streams: per-(symbol, timeframe) buffers fed by historical
// backfill plus a live kline feed
pub mod buffer;
pub mod feed;
pub mod registry;

pub use buffer::{
    CandleSubscriber, ForwardingSubscriber, StreamBuffer, StreamStatus, SubscriptionId,
};
pub use feed::{
    parse_kline_message, ChannelFeed, FeedEvent, HistoricalProvider, KlineUpdate, LiveFeed,
};
pub use registry::{StreamRegistry, DEFAULT_ATR_PERIOD};
