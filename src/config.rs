// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use log::error;

use std::str::FromStr;
use std::time::Duration;

macro_rules! field_from_env {
    ($s: expr, $field: ident) => {
        let env_name = agent_config!(stringify!($field).to_uppercase());
        if let Some(v) = parse_env(&env_name) {
            $s.$field = v;
        }
    };
}

macro_rules! agent_config {
    ($s: expr) => {
        format!("PROF_AGENT_{}", $s)
    };
}

/// Agent-wide tuning knobs. Per-session switches live in
/// [`crate::params::SessionParams`].
#[derive(Debug, Clone)]
pub struct Config {
    // Polling scheduler
    pub timer_interval: Duration,

    // Event subscription
    pub event_wait_timeout: Duration,
    pub pid_query_retries: usize,
    pub pid_query_interval: Duration,

    // Channel poll fan-in
    pub channel_poll_timeout: Duration,
    pub channel_poll_max: usize,
    pub channel_read_buf_size: usize,
    pub flush_max_reads: usize,

    // Host collection
    pub perf_tool: String,
    pub proc_root: String,
    /// How long a tracer gets to exit after SIGINT before it is killed.
    pub tool_stop_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timer_interval: Duration::from_millis(20),
            event_wait_timeout: Duration::from_secs(1),
            pid_query_retries: 50,
            pid_query_interval: Duration::from_millis(200),
            channel_poll_timeout: Duration::from_millis(100),
            channel_poll_max: 64,
            channel_read_buf_size: 2 * 1024 * 1024,
            flush_max_reads: 64,
            perf_tool: String::from("perf"),
            proc_root: String::from("/proc"),
            tool_stop_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut s = Config::default();
        field_from_env!(s, timer_interval);

        field_from_env!(s, event_wait_timeout);
        field_from_env!(s, pid_query_retries);
        field_from_env!(s, pid_query_interval);

        field_from_env!(s, channel_poll_timeout);
        field_from_env!(s, channel_poll_max);
        field_from_env!(s, channel_read_buf_size);
        field_from_env!(s, flush_max_reads);
        s.channel_poll_max = s.channel_poll_max.max(1);
        s.channel_read_buf_size = s.channel_read_buf_size.max(4096);

        field_from_env!(s, perf_tool);
        field_from_env!(s, proc_root);
        field_from_env!(s, tool_stop_timeout);

        s
    }
}

pub(crate) trait FromConfigStr: Sized {
    type Err;
    fn parse(s: &str) -> Result<Self, Self::Err>;
}

macro_rules! default_config_parser {
    ($t: tt) => {
        impl FromConfigStr for $t {
            type Err = <$t as FromStr>::Err;
            fn parse(s: &str) -> Result<Self, Self::Err> {
                <$t as FromStr>::from_str(s)
            }
        }
    };
}

default_config_parser!(String);
default_config_parser!(usize);

mod duration_parser {
    use nom::{
        character::complete::{alpha1, digit1},
        combinator::map_res,
        multi::fold_many1,
        sequence::pair,
        IResult, Parser as _,
    };

    use std::time::Duration;

    fn parse_u64(input: &str) -> IResult<&str, u64> {
        map_res(digit1, |s: &str| s.parse::<u64>()).parse(input)
    }

    fn parse_duration_component(input: &str) -> IResult<&str, Duration> {
        let (input, (value, unit)) = pair(parse_u64, alpha1).parse(input)?;

        let dur = match unit {
            "h" => value.checked_mul(3600).map(Duration::from_secs),
            "m" => value.checked_mul(60).map(Duration::from_secs),
            "s" => Some(Duration::from_secs(value)),
            "ms" => Some(Duration::from_millis(value)),
            "us" => Some(Duration::from_micros(value)),
            _ => {
                return Err(nom::Err::Failure(nom::error::Error::new(
                    unit,
                    nom::error::ErrorKind::Tag,
                )))
            }
        };
        dur.map(|d| (input, d)).ok_or_else(|| {
            nom::Err::Failure(nom::error::Error::new(
                input,
                nom::error::ErrorKind::TooLarge,
            ))
        })
    }

    pub fn parse(input: &str) -> IResult<&str, Duration> {
        let (remaining, maybe_dur) = fold_many1(
            parse_duration_component,
            || Ok(Duration::default()),
            |acc: Result<_, nom::Err<_>>, item| {
                acc?.checked_add(item).ok_or_else(|| {
                    nom::Err::Failure(nom::error::Error::new(
                        input,
                        nom::error::ErrorKind::TooLarge,
                    ))
                })
            },
        )
        .parse(input)?;
        Ok((remaining, maybe_dur?))
    }
}

impl FromConfigStr for Duration {
    type Err = String;
    fn parse(s: &str) -> Result<Self, Self::Err> {
        let s = s.to_lowercase();
        if let Ok((remaining, dur)) = duration_parser::parse(&s) {
            if remaining.is_empty() {
                return Ok(dur);
            }
        }
        Err(format!("Could not parse {} to duration", s))
    }
}

fn parse_env<T>(name: &str) -> Option<T>
where
    T: FromConfigStr,
    <T as FromConfigStr>::Err: std::fmt::Debug,
{
    std::env::var(name).ok().and_then(|s| {
        T::parse(&s)
            .map_err(|e| {
                error!("Error parsing config {}, got error {:?}", name, e);
                e
            })
            .ok()
    })
}
