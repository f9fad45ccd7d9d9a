pub mod canvas;
pub mod google_calendar;
pub mod oauth;
