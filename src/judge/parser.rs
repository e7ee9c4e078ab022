use std::time::Duration;

use thiserror::Error;

use crate::sandbox::{ExecResult, ExecStatus};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed result block header: {0}")]
    Header(String),
    #[error("result block terminator missing after {declared}-byte payload")]
    MissingTerminator { declared: usize },
}

/// Demultiplexes the batch runner's concatenated stdout into one
/// `ExecResult` per test case.
///
/// Each block is framed as
///
/// ```text
/// <stdout-bytes> <exit-code> <elapsed-seconds> <max-rss-kib>\n
/// <stdout payload, exactly stdout-bytes bytes>\n
/// ```
///
/// The leading byte count keeps the framing collision-free with arbitrary
/// user output. A tail that is a clean prefix of a block (the runner was
/// killed mid-emission by the outer wall cap) yields `None` rather than an
/// error; whether that missing block is tolerable is the caller's call.
pub struct ExecResultParser {
    data: Vec<u8>,
    pos: usize,
    time_limit: Duration,
    memory_limit_bytes: u64,
}

impl ExecResultParser {
    pub fn new(stdout: Vec<u8>, time_limit: Duration, memory_limit_bytes: u64) -> Self {
        ExecResultParser {
            data: stdout,
            pos: 0,
            time_limit,
            memory_limit_bytes,
        }
    }

    /// Yields the next per-case result, `None` after the last block.
    pub fn next(&mut self) -> Result<Option<ExecResult>, ParseError> {
        if self.pos >= self.data.len() {
            return Ok(None);
        }

        let rest = &self.data[self.pos..];
        let Some(header_end) = rest.iter().position(|&b| b == b'\n') else {
            // Killed while writing the header.
            self.pos = self.data.len();
            return Ok(None);
        };

        let header = std::str::from_utf8(&rest[..header_end])
            .map_err(|_| ParseError::Header("header is not UTF-8".to_string()))?;
        let fields: Vec<&str> = header.split_whitespace().collect();
        if fields.len() != 4 {
            return Err(ParseError::Header(format!(
                "expected 4 fields, got {}: {header:?}",
                fields.len()
            )));
        }
        let stdout_len: usize = parse_field(fields[0], "stdout length")?;
        let exit_code: i64 = parse_field(fields[1], "exit code")?;
        let elapsed_s: f64 = parse_field(fields[2], "elapsed seconds")?;
        let max_rss_kib: u64 = parse_field(fields[3], "max rss")?;

        let payload_start = header_end + 1;
        if rest.len() < payload_start + stdout_len {
            // Killed while writing the payload.
            self.pos = self.data.len();
            return Ok(None);
        }
        let stdout = rest[payload_start..payload_start + stdout_len].to_vec();

        let mut consumed = payload_start + stdout_len;
        match rest.get(consumed) {
            Some(b'\n') => consumed += 1,
            Some(_) => {
                return Err(ParseError::MissingTerminator {
                    declared: stdout_len,
                })
            }
            // Killed right after the payload; the block itself is whole.
            None => {}
        }
        self.pos += consumed;

        let exec_time = Duration::from_secs_f64(elapsed_s.max(0.0));
        let memory_usage = max_rss_kib * 1024;
        let status = if exec_time >= self.time_limit {
            ExecStatus::TimeLimitExceeded
        } else if memory_usage >= self.memory_limit_bytes {
            ExecStatus::MemoryLimitExceeded
        } else if exit_code != 0 {
            ExecStatus::RuntimeError
        } else {
            ExecStatus::Finished
        };

        Ok(Some(ExecResult {
            status,
            exec_time,
            memory_usage,
            stdout,
            stderr: Vec::new(),
            exit_code,
        }))
    }
}

fn parse_field<T: std::str::FromStr>(raw: &str, what: &str) -> Result<T, ParseError> {
    raw.parse()
        .map_err(|_| ParseError::Header(format!("bad {what}: {raw:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::testing::frame_block;

    const TIME_LIMIT: Duration = Duration::from_secs(1);
    const MEMORY_LIMIT: u64 = 256 * 1024 * 1024;

    fn parser(data: Vec<u8>) -> ExecResultParser {
        ExecResultParser::new(data, TIME_LIMIT, MEMORY_LIMIT)
    }

    #[test]
    fn yields_one_result_per_block_in_order() {
        let mut data = frame_block(b"3\n", 0, 0.12, 2048);
        data.extend(frame_block(b"30\n", 0, 0.34, 4096));
        let mut p = parser(data);

        let first = p.next().unwrap().unwrap();
        assert_eq!(first.status, ExecStatus::Finished);
        assert_eq!(first.stdout, b"3\n");
        assert_eq!(first.exec_time, Duration::from_secs_f64(0.12));
        assert_eq!(first.memory_usage, 2048 * 1024);

        let second = p.next().unwrap().unwrap();
        assert_eq!(second.stdout, b"30\n");

        assert!(p.next().unwrap().is_none());
        assert!(p.next().unwrap().is_none());
    }

    #[test]
    fn payload_may_contain_newlines_and_digits() {
        let payload = b"1 2 3\n4 5 6\n";
        let data = frame_block(payload, 0, 0.01, 100);
        let mut p = parser(data);
        assert_eq!(p.next().unwrap().unwrap().stdout, payload);
        assert!(p.next().unwrap().is_none());
    }

    #[test]
    fn time_at_or_over_limit_is_tle() {
        let data = frame_block(b"", 137, 1.0, 100);
        let mut p = parser(data);
        assert_eq!(
            p.next().unwrap().unwrap().status,
            ExecStatus::TimeLimitExceeded
        );
    }

    #[test]
    fn memory_at_or_over_limit_is_mle() {
        let data = frame_block(b"", 0, 0.1, 256 * 1024);
        let mut p = parser(data);
        assert_eq!(
            p.next().unwrap().unwrap().status,
            ExecStatus::MemoryLimitExceeded
        );
    }

    #[test]
    fn nonzero_exit_under_limits_is_runtime_error() {
        let data = frame_block(b"partial", 139, 0.1, 100);
        let mut p = parser(data);
        let res = p.next().unwrap().unwrap();
        assert_eq!(res.status, ExecStatus::RuntimeError);
        assert_eq!(res.exit_code, 139);
    }

    #[test]
    fn empty_stream_has_no_blocks() {
        let mut p = parser(Vec::new());
        assert!(p.next().unwrap().is_none());
    }

    #[test]
    fn malformed_header_is_an_error() {
        let mut p = parser(b"not a header\nrest".to_vec());
        assert!(p.next().is_err());
    }

    #[test]
    fn wrong_field_count_is_an_error() {
        let mut p = parser(b"1 2 3\nx\n".to_vec());
        assert!(p.next().is_err());
    }

    #[test]
    fn truncated_payload_tail_is_tolerated() {
        let mut data = frame_block(b"ok\n", 0, 0.1, 100);
        data.extend_from_slice(b"100 0 0.1 100\nonly a few bytes");
        let mut p = parser(data);
        assert!(p.next().unwrap().is_some());
        assert!(p.next().unwrap().is_none());
    }

    #[test]
    fn truncated_header_tail_is_tolerated() {
        let mut data = frame_block(b"ok\n", 0, 0.1, 100);
        data.extend_from_slice(b"12 0");
        let mut p = parser(data);
        assert!(p.next().unwrap().is_some());
        assert!(p.next().unwrap().is_none());
    }

    #[test]
    fn lying_length_is_an_error() {
        // Declared length stops short of the real payload, so the byte
        // after it is not the terminator.
        let mut p = parser(b"2 0 0.1 100\nabcdef\n".to_vec());
        assert!(p.next().is_err());
    }
}
