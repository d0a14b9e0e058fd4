mod state;

pub(crate) use state::attach;
