pub mod reading;
pub mod session;

pub use reading::{
    BoundaryKey, FusedReading, PassiveReading, Rating, Timed, VisualReading,
    RATING_MAX, RATING_MIN,
};
pub use session::{SessionAppend, SessionLog, SessionStatus, VideoRef};
