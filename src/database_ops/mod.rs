pub mod db;
pub mod igdb;
pub mod patch_notes;
