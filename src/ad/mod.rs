//! 广告生命周期：把外部观察到的填充状态映射为受控的重试与刷新调度。
//!
//! # Ad Lifecycle
//!
//! Each [`AdSlot`] owns one [`AdStatus`]:
//!
//! ```text
//! init -> pending | hidden -> filled | unfilled | failed -> (retry | refresh) -> pending
//! ```
//!
//! Status values arrive from the page through a [`StatusFeed`]. On every change the
//! slot plans at most one re-render:
//!
//! - `unfilled` considers only the retry path: after `retry_delay`, while the retry
//!   budget allows it (`retry_count == 0` is unlimited)
//! - every other status considers only the refresh path: after `refresh_interval`
//!   plus up to one second of jitter
//! - a width change while `filled` (with `refresh_on_resize`) resets the retry
//!   counter and re-renders at once
//!
//! Only the latest scheduled re-render is honored. A re-render sets `pending`,
//! increments the retry counter, restores the slot markup and activates it again.

mod config;
mod feed;
mod renderer;
mod service;
mod slot;
mod status;

pub use config::AdSlotConfig;
pub use feed::{SlotStatusEvent, StatusFeed};
pub use renderer::{RecordingRenderer, RenderCall, SlotRenderer};
pub use service::AdService;
pub use slot::{AdSlot, AdSlotBuilder, Jitter, StatusChanges};
pub use status::AdStatus;
