use super::{Exchange, Failure, Response};
use crate::http::Status;

/// Answer with the first entry of the location's redirect table.
pub(super) fn handle(exchange: &mut Exchange) -> Result<Response, Failure> {
    let location = exchange.location()?;
    let (code, target) = location.redirect.iter().next().ok_or_else(|| {
        Failure::new(
            Status::INTERNAL_SERVER_ERROR,
            format!("location {} has no redirect", location.path),
        )
    })?;
    Ok(Response::new(Status(*code)).with_header("Location", target))
}

#[cfg(test)]
mod test {
    use crate::http::Status;
    use crate::response::test::Fixture;

    #[test]
    fn redirects_to_first_entry() {
        let mut fixture = Fixture::new(
            "    locations:\n      \"/\": {}\n      \"/old\": {redirect: {308: \"/b\", 301: \"https://example.com/new\"}}\n",
        );
        let (_, response) = fixture.respond(b"GET /old/page.html HTTP/1.1\r\n\r\n");
        assert_eq!(response.status, Status(301));
        assert_eq!(response.header("Location"), Some("https://example.com/new"));
        assert!(response.body().is_empty());
    }
}
