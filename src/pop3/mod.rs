mod codec;
mod session;

pub use session::Pop3Access;
