//! Path-pattern matching for the control plane: literal segments and
//! `{name}` parameters, matched against an already-lowercased path.

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Param(&'static str),
}

struct Route<T> {
    segments: Vec<Segment>,
    value: T,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Params(Vec<(&'static str, String)>);

impl Params {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.as_str())
    }
}

pub struct Router<T> {
    routes: Vec<Route<T>>,
}

impl<T> Router<T> {
    pub fn new() -> Router<T> {
        Router { routes: Vec::new() }
    }

    /// Register a pattern like `bus/{id}/add`. Parameter names must be
    /// static; patterns are matched in registration order.
    pub fn add(&mut self, pattern: &'static str, value: T) {
        let segments = pattern
            .split('/')
            .map(|segment| {
                segment
                    .strip_prefix('{')
                    .and_then(|s| s.strip_suffix('}'))
                    .map(Segment::Param)
                    .unwrap_or_else(|| Segment::Literal(segment.to_ascii_lowercase()))
            })
            .collect();
        self.routes.push(Route { segments, value });
    }

    pub fn match_path(&self, path: &str) -> Option<(&T, Params)> {
        let parts: Vec<&str> = path.split('/').collect();
        'route: for route in &self.routes {
            if route.segments.len() != parts.len() {
                continue;
            }
            let mut params = Vec::new();
            for (segment, part) in route.segments.iter().zip(&parts) {
                match segment {
                    Segment::Literal(lit) if lit == part => {}
                    Segment::Literal(_) => continue 'route,
                    Segment::Param(name) => params.push((*name, (*part).to_owned())),
                }
            }
            return Some((&route.value, Params(params)));
        }
        None
    }
}
