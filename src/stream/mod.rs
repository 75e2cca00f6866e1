pub mod coalescer;
pub mod feeds;
pub mod frame;
pub mod hub;

pub use coalescer::ChangeCoalescer;
pub use feeds::{FeedGuard, LiveFeeds};
pub use frame::{EVENT_STREAM_CONTENT_TYPE, data_frame, error_frame};
pub use hub::{StreamHub, Subscriber, SubscriberStream};
