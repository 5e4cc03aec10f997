#[cfg(unix)]
mod scheduling;
