// Daemonization support for Unix systems

use crate::error::{Result, VigilError};

#[cfg(unix)]
pub fn daemonize() -> Result<()> {
    use nix::unistd::{fork, setsid, ForkResult};
    use std::fs::OpenOptions;
    use std::os::unix::io::AsRawFd;

    // First fork
    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => {
            // Parent process exits
            std::process::exit(0);
        }
        Ok(ForkResult::Child) => {
            // Child continues
        }
        Err(e) => {
            return Err(VigilError::Other(format!("First fork failed: {}", e)));
        }
    }

    // Create new session and become session leader
    setsid().map_err(|e| VigilError::Other(format!("setsid failed: {}", e)))?;

    // Second fork so the daemon is not a session leader and can never
    // reacquire a controlling terminal
    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => {
            // Parent process exits
            std::process::exit(0);
        }
        Ok(ForkResult::Child) => {
            // Child continues as daemon
        }
        Err(e) => {
            return Err(VigilError::Other(format!("Second fork failed: {}", e)));
        }
    }

    // Change working directory to root to avoid keeping any directory in use
    std::env::set_current_dir("/")
        .map_err(|e| VigilError::Other(format!("Failed to change directory to /: {}", e)))?;

    // Redirect stdin, stdout, stderr to /dev/null
    let devnull = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .map_err(|e| VigilError::Other(format!("Failed to open /dev/null: {}", e)))?;

    let devnull_fd = devnull.as_raw_fd();

    use nix::libc;
    unsafe {
        libc::dup2(devnull_fd, libc::STDIN_FILENO);
        libc::dup2(devnull_fd, libc::STDOUT_FILENO);
        libc::dup2(devnull_fd, libc::STDERR_FILENO);
    }

    Ok(())
}

#[cfg(not(unix))]
pub fn daemonize() -> Result<()> {
    Err(VigilError::Other(
        "Daemonization is only supported on Unix systems".to_string(),
    ))
}
