/// The three tokens of an HTTP request line, borrowed from the connection's input buffer.
#[derive(Debug, PartialEq)]
pub struct RequestLine<'a> {
    pub method: &'a [u8],
    pub uri: &'a [u8],
    pub version: &'a [u8],
}

#[derive(Debug, PartialEq)]
pub enum ParseError {
    MissingMethod,
    MissingUri,
    MissingVersion,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let token = match self {
            Self::MissingMethod => "method",
            Self::MissingUri => "URI",
            Self::MissingVersion => "protocol version",
        };
        write!(f, "request line has no {}", token)
    }
}

impl std::error::Error for ParseError {}

/// Return true once the first line of the request has arrived.
pub fn has_request_line(request: &[u8]) -> bool {
    request.contains(&b'\n')
}

/// Parse a request line like "GET / HTTP/1.1" into its method, URI and version. Only the bytes
/// before the first line ending are considered. Tokens after the version are ignored.
pub fn parse_request_line(request: &[u8]) -> Result<RequestLine<'_>, ParseError> {
    let line = request
        .split(|&b| matches!(b, b'\r' | b'\n'))
        .next()
        .unwrap_or(&[]);
    let mut tokens = line
        .split(|&b| matches!(b, b' ' | b'\t'))
        .filter(|token| !token.is_empty());

    let method = tokens.next().ok_or(ParseError::MissingMethod)?;
    let uri = tokens.next().ok_or(ParseError::MissingUri)?;
    let version = tokens.next().ok_or(ParseError::MissingVersion)?;
    Ok(RequestLine {
        method,
        uri,
        version,
    })
}
