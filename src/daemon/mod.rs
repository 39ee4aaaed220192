// Daemon module - detaching a guardian process from its controlling
// terminal

pub mod daemonize;

pub use daemonize::daemonize;
