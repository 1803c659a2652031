pub mod bench;
pub mod device;
pub mod error;
pub mod group;
pub mod report;
pub mod session;

#[cfg(test)]
mod test;
