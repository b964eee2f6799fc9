mod round_robin;

pub(crate) use round_robin::select_connection;
pub use round_robin::RoundRobin;
