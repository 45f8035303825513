pub mod group;
pub mod messaging;
pub mod util;
pub mod test_util;
