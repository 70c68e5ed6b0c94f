pub mod check_slug;
pub mod init;
pub mod serve;
pub mod show;

pub use check_slug::{check_slug, CheckSlugArgs};
pub use init::{init, InitArgs};
pub use serve::{serve, ServeArgs};
pub use show::{show, ShowArgs};
