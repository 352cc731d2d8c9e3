//! Status reason phrases and error-page descriptions.

/// Short reason phrase for a status line.
pub fn reason(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        416 => "Requested Range Not Satisfiable",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "",
    }
}

/// Longer explanation shown on error pages.
pub fn description(code: u16) -> &'static str {
    match code {
        301 => "Object moved permanently -- see URI list",
        302 => "Object moved temporarily -- see URI list",
        303 => "Object moved -- see Method and URL list",
        400 => "Bad request syntax or unsupported method",
        401 => "No permission -- see authorization schemes",
        403 => "Request forbidden -- authorization will not help",
        404 => "Nothing matches the given URI",
        405 => "Specified method is invalid for this resource.",
        408 => "Request timed out; try again later.",
        413 => "Entity is too large.",
        414 => "URI is too long.",
        416 => "Cannot satisfy request range.",
        500 => "Server got itself in trouble",
        501 => "Server does not support this operation",
        502 => "Invalid responses from another server/proxy.",
        503 => "The server cannot process the request due to a high load",
        504 => "The gateway server did not receive a timely response",
        505 => "Cannot fulfill request.",
        _ => "???",
    }
}

/// Statuses whose responses never carry a body.
pub fn is_bodiless(code: u16) -> bool {
    matches!(code, 100..=199 | 204 | 304)
}
