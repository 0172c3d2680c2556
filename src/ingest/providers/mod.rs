pub mod channel;
pub mod feed;

pub use channel::ChannelAdapter;
pub use feed::{FeedAdapter, FeedFetcher, HttpFeedFetcher, StaticFeedFetcher};
