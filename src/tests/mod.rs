mod middleware;
mod server;
