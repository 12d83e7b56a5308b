pub mod breakdown;
pub mod event;
pub mod rollup;
pub mod window;

pub use breakdown::{percentage, round2, BreakdownItem, TimelinePoint};
pub use event::{ClickEvent, Device, DeviceType, Location, Referrer, ReferrerType, Software, Utm};
pub use rollup::{RollupPeriod, RollupRecord};
pub use window::{parse_date, DateWindow, Granularity};
