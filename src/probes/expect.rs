//! TCP expect-script steps (spec §3 "Expect steps", §4.2 TCPSocket action).
//!
//! Adapted from `examples/original_source/src/bunny/egress/expect.go`:
//! an ordered sequence of `Send`/`Receive` steps run over a single TCP
//! connection, short-circuiting on the first failure.

use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::{config::ExpectStepConfig, errors::ProbeError};

/// One compiled expect-script step.
#[derive(Debug, Clone)]
pub enum ExpectStep {
    /// Write `text` followed by `delimiter`, flushing fully.
    Send {
        /// Bytes to write before the delimiter.
        text: String,
        /// Single byte appended after `text`.
        delimiter: u8,
    },
    /// Read up to `delimiter`, strip it, and match the remainder against `regex`.
    Receive {
        /// Pattern the delimiter-stripped text must match.
        regex: Regex,
        /// Single byte the reader stops at.
        delimiter: u8,
    },
}

impl ExpectStep {
    /// Compile one config entry. Rejects steps with both or neither of
    /// `send`/`receive` set, and delimiters that are not exactly one byte.
    pub fn compile(cfg: &ExpectStepConfig) -> Result<Self, String> {
        match (&cfg.send, &cfg.receive) {
            (Some(_), Some(_)) => Err("expect step has both send and receive".into()),
            (None, None) => Err("expect step has neither send nor receive".into()),
            (Some(send), None) => {
                let delimiter = single_byte(&send.delimiter)?;
                Ok(Self::Send {
                    text: send.text.clone(),
                    delimiter,
                })
            }
            (None, Some(recv)) => {
                let delimiter = single_byte(&recv.delimiter)?;
                let regex = Regex::new(&recv.regex).map_err(|e| e.to_string())?;
                Ok(Self::Receive { regex, delimiter })
            }
        }
    }
}

fn single_byte(s: &str) -> Result<u8, String> {
    let bytes = s.as_bytes();
    if bytes.len() != 1 {
        return Err(format!("delimiter must be exactly one byte, got {s:?}"));
    }
    Ok(bytes[0])
}

/// Run a compiled expect script over `stream`, short-circuiting on the
/// first failed or errored step.
pub async fn run<S>(steps: &[ExpectStep], mut stream: S) -> Result<(), ProbeError>
where
    S: AsyncReadExt + AsyncWriteExt + Unpin,
{
    for (index, step) in steps.iter().enumerate() {
        match step {
            ExpectStep::Send { text, delimiter } => {
                let mut buf = text.clone().into_bytes();
                buf.push(*delimiter);
                stream.write_all(&buf).await.map_err(|e| ProbeError::Expect {
                    step: index,
                    reason: e.to_string(),
                })?;
                stream.flush().await.map_err(|e| ProbeError::Expect {
                    step: index,
                    reason: e.to_string(),
                })?;
            }
            ExpectStep::Receive { regex, delimiter } => {
                let mut buf = Vec::new();
                loop {
                    let mut byte = [0u8; 1];
                    let n = stream.read(&mut byte).await.map_err(|e| ProbeError::Expect {
                        step: index,
                        reason: e.to_string(),
                    })?;
                    if n == 0 {
                        return Err(ProbeError::Expect {
                            step: index,
                            reason: "connection closed before delimiter".into(),
                        });
                    }
                    if byte[0] == *delimiter {
                        break;
                    }
                    buf.push(byte[0]);
                }
                let text = String::from_utf8_lossy(&buf);
                if !regex.is_match(&text) {
                    return Err(ProbeError::Expect {
                        step: index,
                        reason: format!("{text:?} did not match {regex}"),
                    });
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn rejects_ambiguous_step() {
        let cfg = ExpectStepConfig::default();
        assert!(ExpectStep::compile(&cfg).is_err());
    }

    #[tokio::test]
    async fn send_then_receive_round_trip() {
        let (mut a, b) = duplex(64);
        let steps = vec![
            ExpectStep::Send {
                text: "hello".into(),
                delimiter: b'\n',
            },
            ExpectStep::Receive {
                regex: Regex::new("^world$").unwrap(),
                delimiter: b'\n',
            },
        ];
        let fixture = tokio::spawn(async move {
            let mut buf = Vec::new();
            let mut byte = [0u8; 1];
            loop {
                a.read_exact(&mut byte).await.unwrap();
                if byte[0] == b'\n' {
                    break;
                }
                buf.push(byte[0]);
            }
            assert_eq!(buf, b"hello");
            a.write_all(b"world\n").await.unwrap();
        });
        run(&steps, b).await.unwrap();
        fixture.await.unwrap();
    }

    #[tokio::test]
    async fn mismatched_response_fails() {
        let (mut a, b) = duplex(64);
        let steps = vec![
            ExpectStep::Send {
                text: "hello".into(),
                delimiter: b'\n',
            },
            ExpectStep::Receive {
                regex: Regex::new("^world$").unwrap(),
                delimiter: b'\n',
            },
        ];
        let fixture = tokio::spawn(async move {
            let mut buf = [0u8; 6];
            a.read_exact(&mut buf).await.unwrap();
            a.write_all(b"goodbye\n").await.unwrap();
        });
        let result = run(&steps, b).await;
        assert!(result.is_err());
        fixture.await.unwrap();
    }
}
