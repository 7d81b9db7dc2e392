//! Parser for `WWW-Authenticate: Bearer realm="...",service="...",scope="..."`.

use reqwest::header::HeaderValue;

#[derive(Default, Debug)]
pub struct BearerChallenge<'a> {
    pub realm: Option<&'a str>,
    pub service: Option<&'a str>,
    pub scope: Option<&'a str>,
}

pub struct BearerRealmService<'a> {
    pub realm: &'a str,
    pub service: &'a str,
}

pub fn parse_header(input: &HeaderValue) -> Option<BearerRealmService<'_>> {
    let res = parse_str(input.to_str().ok()?)?;
    Some(BearerRealmService {
        realm: res.realm?,
        service: res.service?,
    })
}

pub fn parse_str(input: &str) -> Option<BearerChallenge<'_>> {
    use nom::{
        IResult, Parser,
        bytes::{complete::tag, take_until1},
        character::complete::{alpha1, char},
        multi::{many0, many1, separated_list0},
        sequence::{delimited, preceded, separated_pair, terminated},
    };
    fn parser(input: &str) -> IResult<&str, Vec<(&str, &str)>> {
        let (input, matches) = preceded(
            terminated(tag("Bearer"), many1(tag(" "))),
            separated_list0(
                terminated(tag(","), many0(tag(" "))),
                separated_pair(
                    alpha1,
                    tag("="),
                    delimited(char('"'), take_until1("\""), char('"')),
                ),
            ),
        )
        .parse(input)?;
        Ok((input, matches))
    }
    let (_, matches) = parser(input).ok()?;
    let mut ret = BearerChallenge::default();
    for (k, v) in matches.into_iter() {
        match k {
            "realm" => ret.realm = Some(v),
            "service" => ret.service = Some(v),
            "scope" => ret.scope = Some(v),
            _ => {}
        }
    }
    Some(ret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_challenge_variants() {
        let cases = [
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:samalba/my-app:pull,push""#,
            r#"Bearer realm="https://auth.docker.io/token", service="registry.docker.io",scope="repository:samalba/my-app:pull,push""#,
            r#"Bearer realm="https://auth.docker.io/token", service="registry.docker.io", scope="repository:samalba/my-app:pull,push""#,
            r#"Bearer    realm="https://auth.docker.io/token",   service="registry.docker.io", scope="repository:samalba/my-app:pull,push""#,
            r#"Bearer   service="registry.docker.io", scope="repository:samalba/my-app:pull,push",realm="https://auth.docker.io/token""#,
        ];
        for case in cases.iter() {
            let x = parse_str(case).unwrap();
            assert_eq!(x.realm, Some("https://auth.docker.io/token"), "{}", case);
            assert_eq!(x.service, Some("registry.docker.io"), "{}", case);
            assert_eq!(
                x.scope,
                Some("repository:samalba/my-app:pull,push"),
                "{}",
                case
            );
        }
    }

    #[test]
    fn test_missing_realm() {
        assert!(parse_str(r#"Bearer service="registry.docker.io""#).is_some());
        assert!(parse_header(&HeaderValue::from_static(r#"Basic realm="foo""#)).is_none());
    }
}
