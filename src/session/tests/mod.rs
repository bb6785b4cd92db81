mod handler;
mod server;
