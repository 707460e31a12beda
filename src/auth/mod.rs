pub mod middleware;
pub mod providers;


pub use middleware::{AuthOutcome, Authenticator};
pub use providers::{JwtClaims, JwtValidator, TokenValidator};
