mod backend;
mod event;
