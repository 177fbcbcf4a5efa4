pub mod cameras;
pub mod farms;
pub mod notifications;
pub mod user_tokens;

pub use cameras::CamerasRepository;
pub use farms::FarmsRepository;
pub use notifications::NotificationsRepository;
pub use user_tokens::UserTokensRepository;
