mod bandwidth;
mod util;
