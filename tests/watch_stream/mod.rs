mod concurrent_writers;
mod slow_consumer;
