pub(crate) mod capture;
mod state;

pub(crate) use state::attach;
