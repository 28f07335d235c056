// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Kernel command line parser.

use log::error;
use logos::Logos;

use crate::error::{ConfigError, KResult};

/// Definition to parse the kernel command-line arguments.
#[derive(Logos, Debug, PartialEq, Clone, Copy)]
enum CmdToken {
    /// Kernel binary name
    #[regex("./[a-zA-Z]+")]
    KernelBinary,

    /// Kernel log level
    #[token("log")]
    Log,

    /// Workload to launch after bring-up
    #[token("workload")]
    Workload,

    /// Initialize profiling support
    #[token("instrument")]
    Instrument,

    /// Initialize the language runtime
    #[token("runtime")]
    Runtime,

    /// Write the boot marker
    #[token("marker")]
    Marker,

    #[regex("[a-zA-Z0-9\\._-]+")]
    Ident,

    #[token("=", priority = 22)]
    KVSeparator,

    #[regex(r#"'([^'\\]|\\t|\\u|\\n|[0-9a-zA-Z:.,_=]*|\\')*'"#)]
    LiteralString,

    /// Anything not properly encoded
    #[error]
    #[regex(r"[ ]+", logos::skip)]
    Error,
}

impl CmdToken {
    fn is_key(&self) -> bool {
        matches!(
            self,
            CmdToken::Log
                | CmdToken::Workload
                | CmdToken::Instrument
                | CmdToken::Runtime
                | CmdToken::Marker
        )
    }
}

/// Settings for the boot sequence, parsed from the command line the
/// bootloader passes to the kernel.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BootConfig {
    /// Log filter handed to the console (e.g., `info` or `smpboot=trace`;
    /// consoles without per-module filtering apply the level globally).
    pub log_filter: &'static str,
    /// Workload launched in the workload phase, if any.
    pub workload: Option<&'static str>,
    /// Whether to initialize instrumentation and bracket the workload with it.
    pub instrument: bool,
    /// Whether to initialize the language runtime.
    pub runtime: bool,
    /// Whether to write the boot marker before the first phase.
    pub boot_marker: bool,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            log_filter: "info",
            workload: None,
            instrument: false,
            runtime: false,
            boot_marker: false,
        }
    }
}

impl BootConfig {
    /// Parse the command line arguments.
    ///
    /// Example: If args is './kernel log=trace marker=on' -> sets level to
    /// trace and enables the boot marker.
    pub fn from_str(args: &'static str) -> KResult<Self> {
        let mut parsed_args: BootConfig = Default::default();
        let mut lexer = CmdToken::lexer(args);
        let mut prev = CmdToken::Error;
        while let Some(token) = lexer.next() {
            let slice = lexer.slice();

            match token {
                CmdToken::KernelBinary => {}
                CmdToken::Log
                | CmdToken::Workload
                | CmdToken::Instrument
                | CmdToken::Runtime
                | CmdToken::Marker => {
                    prev = token;
                }
                CmdToken::Ident => {
                    if !prev.is_key() {
                        error!("Invalid cmd arguments: {} (skipped {})", args, slice);
                        return Err(ConfigError::InvalidCmdLineOptions.into());
                    }
                    parsed_args.apply(prev, slice)?;
                    prev = CmdToken::Error;
                }
                CmdToken::KVSeparator => {
                    if !prev.is_key() {
                        error!(
                            "Malformed args (unexpected equal sign) in `{}` previous token was {:?}",
                            args, prev
                        );
                        return Err(ConfigError::MalformedCmdLine.into());
                    }
                }
                CmdToken::LiteralString => {
                    // We strip the quotes with 1..slice.len()-1
                    let slice_no_quote = &slice[1..slice.len() - 1];
                    if !prev.is_key() {
                        error!("Invalid cmd arguments: {} (skipped {})", args, slice);
                        continue;
                    }
                    parsed_args.apply(prev, slice_no_quote)?;
                    prev = CmdToken::Error;
                }
                CmdToken::Error => {
                    error!(
                        "Malformed commandline! Encountered '{}' while parsing cmd args: {}",
                        slice, args
                    );
                    return Err(ConfigError::MalformedCmdLine.into());
                }
            }
        }

        Ok(parsed_args)
    }

    /// Sets the value of `key`.
    fn apply(&mut self, key: CmdToken, value: &'static str) -> KResult<()> {
        match key {
            CmdToken::Log => self.log_filter = value,
            CmdToken::Workload => self.workload = Some(value),
            CmdToken::Instrument => self.instrument = parse_flag(value)?,
            CmdToken::Runtime => self.runtime = parse_flag(value)?,
            CmdToken::Marker => self.boot_marker = parse_flag(value)?,
            _ => return Err(ConfigError::InvalidCmdLineOptions.into()),
        }
        Ok(())
    }

    pub fn with_log_filter(mut self, filter: &'static str) -> Self {
        self.log_filter = filter;
        self
    }

    pub fn with_workload(mut self, name: &'static str) -> Self {
        self.workload = Some(name);
        self
    }

    pub fn with_instrumentation(mut self, on: bool) -> Self {
        self.instrument = on;
        self
    }

    pub fn with_runtime(mut self, on: bool) -> Self {
        self.runtime = on;
        self
    }

    pub fn with_boot_marker(mut self, on: bool) -> Self {
        self.boot_marker = on;
        self
    }
}

fn parse_flag(value: &str) -> KResult<bool> {
    match value {
        "on" | "true" | "1" => Ok(true),
        "off" | "false" | "0" => Ok(false),
        _ => {
            error!("Expected on/off, got '{}'", value);
            Err(ConfigError::InvalidCmdLineOptions.into())
        }
    }
}

#[cfg(test)]
mod test {
    use super::BootConfig;
    use crate::error::{ConfigError, KError};
    use alloc::boxed::Box;
    use alloc::format;
    use proptest::prelude::*;

    #[test]
    fn parse_args_empty() {
        let ba = BootConfig::from_str("").expect("failed to parse cmdline");
        assert_eq!(ba, BootConfig::default());
        assert_eq!(ba.log_filter, "info");
    }

    #[test]
    fn parse_args_basic() {
        let ba = BootConfig::from_str("./kernel").expect("failed to parse cmdline");
        assert_eq!(ba, BootConfig::default());
    }

    #[test]
    fn parse_args_log() {
        let ba = BootConfig::from_str("./kernel log=error").expect("failed to parse cmdline");
        assert_eq!(ba.log_filter, "error");
        assert_eq!(ba.workload, None);
        assert!(!ba.boot_marker);
    }

    #[test]
    fn parse_args_all() {
        let ba = BootConfig::from_str(
            "./kernel log=trace workload=legion instrument=on runtime=true marker=1",
        )
        .expect("failed to parse cmdline");
        assert_eq!(
            ba,
            BootConfig::default()
                .with_log_filter("trace")
                .with_workload("legion")
                .with_instrumentation(true)
                .with_runtime(true)
                .with_boot_marker(true)
        );
    }

    #[test]
    fn parse_args_literal() {
        let ba = BootConfig::from_str("./kernel log='smpboot::barrier=trace' marker=off")
            .expect("failed to parse cmdline");
        assert_eq!(ba.log_filter, "smpboot::barrier=trace");
        assert!(!ba.boot_marker);
    }

    #[test]
    fn parse_args_bad_flag() {
        assert_eq!(
            BootConfig::from_str("./kernel marker=maybe"),
            Err(KError::from(ConfigError::InvalidCmdLineOptions))
        );
    }

    #[test]
    fn parse_args_invalid() {
        assert_eq!(
            BootConfig::from_str("./kernel foo"),
            Err(KError::from(ConfigError::InvalidCmdLineOptions))
        );
        assert_eq!(
            BootConfig::from_str("./kernel =trace"),
            Err(KError::from(ConfigError::MalformedCmdLine))
        );
        assert_eq!(
            BootConfig::from_str("./kernel log=info ?"),
            Err(KError::from(ConfigError::MalformedCmdLine))
        );
    }

    proptest! {
        #[test]
        fn parse_args_roundtrip(
            filter in "[a-z]{1,8}_[a-z]{1,4}",
            workload in proptest::option::of("[a-z]{1,8}_[0-9]{1,2}"),
            instrument in any::<bool>(),
            runtime in any::<bool>(),
            marker in any::<bool>(),
        ) {
            let flag = |b: bool| if b { "on" } else { "off" };
            let mut args = format!(
                "./kernel log={} instrument={} runtime={} marker={}",
                filter, flag(instrument), flag(runtime), flag(marker)
            );
            if let Some(w) = &workload {
                args.push_str(&format!(" workload={}", w));
            }
            let args: &'static str = Box::leak(args.into_boxed_str());

            let ba = BootConfig::from_str(args).expect("failed to parse cmdline");
            prop_assert_eq!(ba.log_filter, filter.as_str());
            prop_assert_eq!(ba.workload, workload.as_deref());
            prop_assert_eq!(ba.instrument, instrument);
            prop_assert_eq!(ba.runtime, runtime);
            prop_assert_eq!(ba.boot_marker, marker);
        }
    }
}
