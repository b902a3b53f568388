use crate::client_proto::{code_of, is_final};
use crate::error::PowermanError;

/// One response line split into its code and text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseLine {
    pub code: u16,
    pub text: String,
}

impl ResponseLine {
    pub fn parse(line: &str) -> Result<Self, PowermanError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let code = code_of(line)
            .ok_or_else(|| PowermanError::Protocol(format!("malformed response line: '{line}'")))?;
        Ok(Self {
            code,
            text: line.get(4..).unwrap_or_default().to_string(),
        })
    }
}

/// Complete server response: interim 3xx lines and the final 1xx/2xx line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub lines: Vec<ResponseLine>,
    pub code: u16,
    pub text: String,
}

impl Response {
    /// Collect lines until a final one. Returns `None` while incomplete.
    pub fn from_lines<'a, I>(lines: I) -> Result<Option<Self>, PowermanError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut interim = Vec::new();
        for l in lines {
            let rl = ResponseLine::parse(l)?;
            if is_final(rl.code) {
                return Ok(Some(Self {
                    lines: interim,
                    code: rl.code,
                    text: rl.text,
                }));
            }
            interim.push(rl);
        }
        Ok(None)
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code < 200
    }

    /// Text of interim lines carrying `code`.
    pub fn data(&self, code: u16) -> impl Iterator<Item = &str> {
        self.lines
            .iter()
            .filter(move |l| l.code == code)
            .map(|l| l.text.as_str())
    }

    /// `308` lines reported while the request ran.
    pub fn action_errors(&self) -> impl Iterator<Item = &str> {
        self.data(308)
    }

    /// Map a 2xx completion to `PowermanError::Server`. Completed-with-errors
    /// responses (210/211) still carry data and are returned as is.
    pub fn into_result(self) -> Result<Self, PowermanError> {
        match self.code {
            c if c < 200 || c == 210 || c == 211 => Ok(self),
            code => Err(PowermanError::Server {
                code,
                message: self.text,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_until_final_line() {
        let lines = ["302 on:      t[1-2]", "302 off:     ", "103 Query complete"];
        let r = Response::from_lines(lines).unwrap().unwrap();
        assert!(r.is_success());
        assert_eq!(r.data(302).collect::<Vec<_>>(), vec!["on:      t[1-2]", "off:     "]);
        assert!(Response::from_lines(["302 on:      t1"]).unwrap().is_none());
    }

    #[test]
    fn hard_failures_become_errors() {
        let r = Response::from_lines(["209 No such nodes: x1"]).unwrap().unwrap();
        match r.into_result() {
            Err(PowermanError::Server { code, message }) => {
                assert_eq!(code, 209);
                assert_eq!(message, "No such nodes: x1");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(ResponseLine::parse("garbage").is_err());
    }
}
