//! Agent-side description of a desired place and the candidate matcher.

use crate::place::{Part, Place};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpWant {
    pub local_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbWant {
    pub port_num: u8,
}

/// The requirements for one named slot in an [`ImportSpec`].
///
/// A `PartSpec` matches a `Part` iff its `compatible` set is a subset of
/// the part's tags and every requested interface name exists on the part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartSpec {
    #[serde(default)]
    pub compatible: BTreeSet<String>,
    #[serde(default)]
    pub tcp: BTreeMap<String, TcpWant>,
    #[serde(default)]
    pub usb: BTreeMap<String, UsbWant>,
}

impl PartSpec {
    pub fn matches(&self, part: &Part) -> bool {
        self.compatible.is_subset(&part.compatible)
            && self.tcp.keys().all(|name| part.tcp.contains_key(name))
            && self.usb.keys().all(|name| part.usb.contains_key(name))
    }
}

fn default_auto_return_time() -> Duration {
    Duration::from_secs(10 * 3600)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportSpec {
    #[serde(with = "humantime_serde", default = "default_auto_return_time")]
    pub auto_return_time: Duration,
    pub parts: BTreeMap<String, PartSpec>,
}

/// Assignment from import part-name to the index of the `Place`'s part it
/// was matched against.
pub type Assignment = BTreeMap<String, usize>;

/// Computes a valid assignment of `spec`'s named parts to distinct parts
/// of `place`, if one exists. Returns the first assignment found by a
/// simple backtracking search over `spec.parts` in key order — places in
/// this domain have a handful of parts at most, so this need not be
/// more clever than that.
pub fn candidate_assignment(spec: &ImportSpec, place: &Place) -> Option<Assignment> {
    let names: Vec<&String> = spec.parts.keys().collect();
    let mut used = vec![false; place.parts.len()];
    let mut assignment = Assignment::new();
    if backtrack(spec, place, &names, 0, &mut used, &mut assignment) {
        Some(assignment)
    } else {
        None
    }
}

fn backtrack(
    spec: &ImportSpec,
    place: &Place,
    names: &[&String],
    pos: usize,
    used: &mut [bool],
    assignment: &mut Assignment,
) -> bool {
    if pos == names.len() {
        return true;
    }
    let name = names[pos];
    let part_spec = &spec.parts[name];
    for (idx, part) in place.parts.iter().enumerate() {
        if used[idx] || !part_spec.matches(part) {
            continue;
        }
        used[idx] = true;
        assignment.insert(name.clone(), idx);
        if backtrack(spec, place, names, pos + 1, used, assignment) {
            return true;
        }
        used[idx] = false;
        assignment.remove(name);
    }
    false
}

/// A `Place` is a candidate for `spec` iff at least one valid assignment
/// exists.
pub fn is_candidate(spec: &ImportSpec, place: &Place) -> bool {
    candidate_assignment(spec, place).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::place::TcpEndpoint;

    fn part(tags: &[&str]) -> Part {
        Part {
            compatible: tags.iter().map(|t| t.to_string()).collect(),
            tcp: BTreeMap::new(),
            usb: BTreeMap::new(),
        }
    }

    fn place(id: u64, parts: Vec<Part>) -> Place {
        Place {
            id,
            host: "127.0.0.1".into(),
            port: 2192,
            parts,
        }
    }

    fn spec(parts: BTreeMap<String, PartSpec>) -> ImportSpec {
        ImportSpec {
            auto_return_time: Duration::from_secs(0),
            parts,
        }
    }

    #[test]
    fn subset_tag_matches() {
        let p = part(&["scope", "bench-a"]);
        let ps = PartSpec {
            compatible: ["scope"].into_iter().map(String::from).collect(),
            tcp: BTreeMap::new(),
            usb: BTreeMap::new(),
        };
        assert!(ps.matches(&p));
    }

    #[test]
    fn missing_tag_does_not_match() {
        let p = part(&["scope"]);
        let ps = PartSpec {
            compatible: ["scope", "dmm"].into_iter().map(String::from).collect(),
            tcp: BTreeMap::new(),
            usb: BTreeMap::new(),
        };
        assert!(!ps.matches(&p));
    }

    #[test]
    fn distinct_assignment_required() {
        // Two import parts both requiring "x"; the place has exactly one
        // matching part, so no candidate assignment exists.
        let mut parts = BTreeMap::new();
        let want = PartSpec {
            compatible: ["x"].into_iter().map(String::from).collect(),
            tcp: BTreeMap::new(),
            usb: BTreeMap::new(),
        };
        parts.insert("a".to_string(), want.clone());
        parts.insert("b".to_string(), want);
        let s = spec(parts);
        let p = place(1, vec![part(&["x"])]);
        assert!(candidate_assignment(&s, &p).is_none());
    }

    #[test]
    fn finds_assignment_across_two_parts() {
        let mut parts = BTreeMap::new();
        parts.insert(
            "a".to_string(),
            PartSpec {
                compatible: ["x"].into_iter().map(String::from).collect(),
                tcp: BTreeMap::new(),
                usb: BTreeMap::new(),
            },
        );
        parts.insert(
            "b".to_string(),
            PartSpec {
                compatible: ["y"].into_iter().map(String::from).collect(),
                tcp: BTreeMap::new(),
                usb: BTreeMap::new(),
            },
        );
        let s = spec(parts);
        let p = place(1, vec![part(&["y"]), part(&["x"])]);
        let assignment = candidate_assignment(&s, &p).expect("should match");
        assert_eq!(assignment["a"], 1);
        assert_eq!(assignment["b"], 0);
    }

    #[test]
    fn tcp_interface_name_must_exist() {
        let mut tcp = BTreeMap::new();
        tcp.insert("scpi".to_string(), TcpWant { local_port: 5125 });
        let ps = PartSpec {
            compatible: BTreeSet::new(),
            tcp,
            usb: BTreeMap::new(),
        };
        let mut part_tcp = BTreeMap::new();
        part_tcp.insert(
            "scpi".to_string(),
            TcpEndpoint {
                host: "127.0.0.1".into(),
                port: 5025,
            },
        );
        let matching = Part {
            compatible: BTreeSet::new(),
            tcp: part_tcp,
            usb: BTreeMap::new(),
        };
        assert!(ps.matches(&matching));

        let non_matching = part(&[]);
        assert!(!ps.matches(&non_matching));
    }
}
