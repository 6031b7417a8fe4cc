pub mod connections;
pub mod imports;
pub mod tenant;

pub use tenant::CurrentUser;
