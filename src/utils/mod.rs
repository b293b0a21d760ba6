pub mod checksum;
pub mod fs;
pub mod proc;
