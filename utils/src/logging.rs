// Category-based logging infrastructure
//
// This will be used from multiple threads, so it needs
// to be stateless
//
// Austin Shafer - 2025
#[allow(dead_code, non_camel_case_types)]
#[derive(Copy, Clone)]
pub enum LogLevel {
    // in order of highest priority
    critical, // Urgent and must always be displayed
    error,
    debug, // debugging related, not verbose
    info,  // more verbose
    profiling, // profiling related timing
}

impl LogLevel {
    pub fn get_name(&self) -> &'static str {
        match self {
            LogLevel::critical => "critical",
            LogLevel::error => "error",
            LogLevel::debug => "debug",
            LogLevel::info => "info",
            LogLevel::profiling => "profiling",
        }
    }

    pub fn get_level(&self) -> u32 {
        match self {
            LogLevel::critical => 0,
            LogLevel::error => 1,
            LogLevel::debug => 2,
            LogLevel::info => 3,
            LogLevel::profiling => 4,
        }
    }
}

#[macro_export]
macro_rules! log {
    ($loglevel:expr, $($format_args:tt)+) => ({
        // !! NOTE: current log level set here !!
        //
        // Currently set to the debug level (2)
        if $loglevel.get_level() <= 2 {
            println!("[{:?}]<{}> {}:{} - {}",
                     $crate::timing::get_current_millis(),
                     $loglevel.get_name(),
                     file!(),
                     line!(),
                     format!($($format_args)+)
            );
        }
    })
}

#[macro_export]
macro_rules! critical {
    ($($format_args:tt)+) => ({
        $crate::log!($crate::logging::LogLevel::critical, $($format_args)+)
    })
}

#[macro_export]
macro_rules! error {
    ($($format_args:tt)+) => ({
        $crate::log!($crate::logging::LogLevel::error, $($format_args)+)
    })
}

#[macro_export]
macro_rules! debug {
    ($($format_args:tt)+) => ({
        $crate::log!($crate::logging::LogLevel::debug, $($format_args)+)
    })
}

#[macro_export]
macro_rules! info {
    ($($format_args:tt)+) => ({
        $crate::log!($crate::logging::LogLevel::info, $($format_args)+)
    })
}

#[macro_export]
macro_rules! profiling {
    ($($format_args:tt)+) => ({
        $crate::log!($crate::logging::LogLevel::profiling, $($format_args)+)
    })
}
