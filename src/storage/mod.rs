pub mod migrations;
pub mod page_views;
pub mod sqlite;
pub mod tenant;
