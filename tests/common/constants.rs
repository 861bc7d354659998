//! Show ids seeded into every test catalog.

#![allow(dead_code)]

pub const SHOW_1_ID: &str = "show-1";
pub const SHOW_2_ID: &str = "show-2";
pub const SHOW_3_ID: &str = "show-3";
pub const SHOW_4_ID: &str = "show-4";
pub const SHOW_5_ID: &str = "show-5";

pub const ALL_SHOW_IDS: [&str; 5] = [SHOW_1_ID, SHOW_2_ID, SHOW_3_ID, SHOW_4_ID, SHOW_5_ID];

pub const UNKNOWN_SHOW_ID: &str = "show-404";
