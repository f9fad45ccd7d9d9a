pub mod link_service;
pub mod notifier_service;
pub mod provider_service;
pub mod render_service;
