pub mod command_journal;
pub mod line_ending_handler;
pub mod path_utils;
