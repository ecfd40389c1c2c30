mod codec;
mod sequence_set;
mod session;
mod tag_generator;

pub use session::ImapAccess;
