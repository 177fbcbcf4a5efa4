pub mod camera_models;
pub mod farm_models;
pub mod notification_models;
pub mod user_models;

pub use camera_models::Camera;
pub use farm_models::Farm;
pub use notification_models::Notification;
pub use user_models::{User, UserToken};
