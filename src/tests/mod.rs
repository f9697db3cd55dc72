mod gardening;
mod orchestrator;
mod providers;
mod support;
