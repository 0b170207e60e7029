use perftrace::Error;

// Process exit codes
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const GENERAL_ERROR: i32 = 1;
    pub const INVALID_ARGUMENTS: i32 = 2;
    pub const PERMISSION_DENIED: i32 = 4;
    pub const SIGNAL_ERROR: i32 = 5;
    pub const IO_ERROR: i32 = 6;
}

/// Exit code for a library error.
pub fn exit_code_for(err: &Error) -> i32 {
    match err {
        Error::InvalidArgument(_) => exit_code::INVALID_ARGUMENTS,
        Error::PermissionDenied(_) => exit_code::PERMISSION_DENIED,
        Error::Signal(_) | Error::Timer(_) => exit_code::SIGNAL_ERROR,
        Error::Io(_) => exit_code::IO_ERROR,
        Error::AlreadyStarted => exit_code::GENERAL_ERROR,
    }
}
