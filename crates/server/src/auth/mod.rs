pub mod session;

pub use session::{session_cookie_token, SessionTokenService};
