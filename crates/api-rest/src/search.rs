//! Search parameter parsing and paging links.

use idmp_core::definitions::{search_clause, search_params};
use idmp_core::{CoreConfig, IdmpError, IdmpResult, Query};

const COUNT: &str = "_count";
const OFFSET: &str = "_offset";
const SORT: &str = "_sort";

/// A parsed search request.
#[derive(Debug)]
pub(crate) struct SearchRequest {
    pub query: Query,
    pub count: usize,
    pub offset: usize,
}

impl SearchRequest {
    /// Build the store query for `params`.
    ///
    /// `_count` is capped at the configured maximum page size. Unknown `_` parameters are
    /// rejected; any other name is a search parameter.
    pub fn parse(
        resource_type: &str,
        params: &[(String, String)],
        cfg: &CoreConfig,
    ) -> IdmpResult<Self> {
        let mut count = cfg.default_page_size();
        let mut offset = 0;
        let mut query = Query::new();

        for (name, value) in params {
            match name.as_str() {
                COUNT => count = number(name, value)?.min(cfg.max_page_size()),
                OFFSET => offset = number(name, value)?,
                SORT => {
                    let (param, descending) = match value.strip_prefix('-') {
                        Some(rest) => (rest, true),
                        None => (value.as_str(), false),
                    };
                    query = query.sorted_by(sort_field(resource_type, param), descending);
                }
                other if other.starts_with('_') => {
                    return Err(IdmpError::InvalidInput(format!(
                        "unsupported search parameter '{other}'"
                    )))
                }
                other => query = query.and(search_clause(resource_type, other, value)),
            }
        }

        Ok(Self {
            query: query.page(count, offset),
            count,
            offset,
        })
    }
}

/// `self`, `next` and `previous` links of a searchset.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct PageLinks {
    pub self_link: String,
    pub next: Option<String>,
    pub previous: Option<String>,
}

impl PageLinks {
    /// Links keep the caller's search parameters as sent and replace the paging ones.
    pub fn new(
        resource_type: &str,
        raw: Option<&str>,
        request: &SearchRequest,
        total: usize,
    ) -> Self {
        let kept: Vec<&str> = raw
            .unwrap_or_default()
            .split('&')
            .filter(|pair| !pair.is_empty())
            .filter(|pair| {
                let name = pair.split('=').next().unwrap_or_default();
                name != COUNT && name != OFFSET
            })
            .collect();
        let link = |offset: usize| {
            let mut pairs = kept.clone();
            let paging = format!("{COUNT}={}&{OFFSET}={offset}", request.count);
            pairs.push(paging.as_str());
            format!("/fhir/{resource_type}?{}", pairs.join("&"))
        };

        let next = request
            .offset
            .checked_add(request.count)
            .filter(|end| request.count > 0 && *end < total)
            .map(&link);
        let previous =
            (request.offset > 0).then(|| link(request.offset.saturating_sub(request.count)));
        Self {
            self_link: link(request.offset),
            next,
            previous,
        }
    }
}

fn number(name: &str, value: &str) -> IdmpResult<usize> {
    value.trim().parse().map_err(|_| {
        IdmpError::InvalidInput(format!("{name} must be a non-negative integer, got '{value}'"))
    })
}

/// The field a sort parameter orders by: a declared parameter's field, or the name itself.
fn sort_field(resource_type: &str, param: &str) -> String {
    search_params(resource_type)
        .iter()
        .find(|p| p.name == param)
        .map_or(param, |p| p.field)
        .to_owned()
}
