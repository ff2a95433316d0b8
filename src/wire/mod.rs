pub mod header;
pub mod headers;
pub mod queue_line;
