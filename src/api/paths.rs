//! All Paths are recorded here for use throughout this codebase
pub mod base {
    pub const ROOT: &str = "/";
    pub const HEALTH: &str = "/health";
    pub const ABOUT: &str = "/about";
}

pub mod admission {
    pub const START: &str = "/start";
    pub const END: &str = "/end";
}

pub const QUOTA: &str = "/quota";
