mod engine;
mod schedule;
