use std::collections::BTreeSet;

use crate::cfg::GraphTable;
use crate::engine::{self, RenderedNgram, SearchOptions};
use crate::error::{Error, Result};
use crate::ir::MethodKey;
use crate::policy::DigPolicy;
use crate::signature::parse_location;

/// N-gram size for a trace query; `-1` means the length of the sequence.
pub(crate) fn resolve_ngram_size(requested: i64, sequence_len: usize) -> Result<usize> {
    if sequence_len == 0 {
        return Err(Error::EmptySequence);
    }
    if requested == -1 {
        return Ok(sequence_len);
    }
    let size = usize::try_from(requested)
        .ok()
        .filter(|size| *size > 0)
        .ok_or(Error::InvalidNgramSize(requested))?;
    if size != sequence_len {
        return Err(Error::LengthMismatch {
            expected: size,
            actual: sequence_len,
        });
    }
    Ok(size)
}

/// Group `class.method,index` locations by method, keeping first-seen order.
pub(crate) fn parse_locations<S: AsRef<str>>(locations: &[S]) -> Result<Vec<(MethodKey, Vec<usize>)>> {
    let mut grouped: Vec<(MethodKey, Vec<usize>)> = Vec::new();
    for location in locations {
        let location = location.as_ref();
        let (key, index) =
            parse_location(location).ok_or_else(|| Error::InvalidLocation(location.to_string()))?;
        match grouped.iter_mut().find(|(known, _)| *known == key) {
            Some((_, indices)) => {
                if !indices.contains(&index) {
                    indices.push(index);
                }
            }
            None => grouped.push((key, vec![index])),
        }
    }
    Ok(grouped)
}

/// Concrete n-grams whose label sequence equals `sequence`.
///
/// Each target runs a seeded search from its indices, or a full search
/// when it has none. Without targets every compiled method is searched.
pub(crate) fn find_traces(
    graphs: &GraphTable,
    sequence: &[String],
    targets: &[(MethodKey, Vec<usize>)],
    options: &SearchOptions,
    dig_policy: &dyn DigPolicy,
) -> Result<Vec<RenderedNgram>> {
    let all: Vec<(MethodKey, Vec<usize>)>;
    let targets = if targets.is_empty() {
        all = graphs.keys().into_iter().map(|key| (key, Vec::new())).collect();
        all.as_slice()
    } else {
        targets
    };

    let mut traces = Vec::new();
    for (key, indices) in targets {
        if graphs.get(key).is_none() {
            return Err(Error::UnknownMethod(key.to_string()));
        }
        let found = if indices.is_empty() {
            engine::generate(graphs, key, options, dig_policy)?
        } else {
            engine::generate_from(graphs, key, indices, options, dig_policy)?
        };
        for ngram in found.render().into_iter().flatten() {
            let matches = ngram.len() == sequence.len()
                && ngram.iter().zip(sequence).all(|(step, label)| step.label == *label);
            if matches && !traces.contains(&ngram) {
                traces.push(ngram);
            }
        }
    }
    Ok(traces)
}

/// Locations visited by every trace.
pub(crate) fn common_locations(traces: &[RenderedNgram]) -> BTreeSet<&str> {
    let Some((first, rest)) = traces.split_first() else {
        return BTreeSet::new();
    };
    let mut common: BTreeSet<&str> = first.iter().map(|step| step.location.as_str()).collect();
    for trace in rest {
        let locations: BTreeSet<&str> = trace.iter().map(|step| step.location.as_str()).collect();
        common.retain(|location| locations.contains(location));
    }
    common
}

/// Deepest call depth among the traces. Without traces, the deepest
/// ` >depth` suffix among the requested locations.
pub(crate) fn max_depth<S: AsRef<str>>(traces: &[RenderedNgram], locations: &[S]) -> usize {
    if traces.is_empty() {
        return locations
            .iter()
            .filter_map(|location| location_depth(location.as_ref()))
            .max()
            .unwrap_or(0);
    }
    traces
        .iter()
        .flatten()
        .map(|step| step.depth)
        .max()
        .unwrap_or(0)
}

/// Number of distinct callees in the sequence.
pub(crate) fn unique_method_count(traces: &[RenderedNgram], sequence: &[String]) -> usize {
    match traces.first() {
        Some(trace) => trace
            .iter()
            .map(|step| step.label.as_str())
            .collect::<BTreeSet<_>>()
            .len(),
        None => sequence.iter().collect::<BTreeSet<_>>().len(),
    }
}

fn location_depth(location: &str) -> Option<usize> {
    let (_, depth) = location.rsplit_once('>')?;
    depth.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{CompileOptions, compile};
    use crate::engine::GramStep;
    use crate::ir::{Instruction, MethodBody};
    use crate::policy::undigged::CommonObjectMethods;

    fn graphs() -> GraphTable {
        let call = |method: &str| {
            Some(Instruction::new(
                "invokestatic",
                &["#1"],
                Some(format!("// Method t/Util.{method}").as_str()),
            ))
        };
        let body = MethodBody {
            slots: vec![
                call("a:()V"),
                call("b:()V"),
                call("a:()V"),
                call("b:()V"),
                call("c:()V"),
                Some(Instruction::new("return", &[], None)),
            ],
        };
        let key = MethodKey::new("t/Sample", "run:()V");
        let graph = compile(&key, &body, None, CompileOptions::default()).expect("compile");
        let mut graphs = GraphTable::default();
        graphs.insert(key, graph);
        graphs
    }

    fn sequence(labels: &[&str]) -> Vec<String> {
        labels.iter().map(|label| label.to_string()).collect()
    }

    fn locations(trace: &RenderedNgram) -> Vec<&str> {
        trace.iter().map(|step| step.location.as_str()).collect()
    }

    #[test]
    fn resolve_ngram_size_checks_the_sequence() {
        assert_eq!(3, resolve_ngram_size(-1, 3).expect("derived"));
        assert_eq!(2, resolve_ngram_size(2, 2).expect("explicit"));
        assert!(matches!(resolve_ngram_size(6, 0), Err(Error::EmptySequence)));
        assert!(matches!(
            resolve_ngram_size(6, 3),
            Err(Error::LengthMismatch {
                expected: 6,
                actual: 3
            })
        ));
        assert!(matches!(resolve_ngram_size(0, 3), Err(Error::InvalidNgramSize(0))));
    }

    #[test]
    fn parse_locations_groups_indices_by_method() {
        let grouped = parse_locations(&["t/A.m:()V,3 >0", "t/B.n:()V,1", "t/A.m:()V,7", "t/A.m:()V,3"])
            .expect("parse");

        assert_eq!(
            vec![
                (MethodKey::new("t/A", "m:()V"), vec![3, 7]),
                (MethodKey::new("t/B", "n:()V"), vec![1]),
            ],
            grouped
        );
        assert!(matches!(parse_locations(&["nowhere"]), Err(Error::InvalidLocation(_))));
    }

    #[test]
    fn find_traces_lists_every_occurrence() {
        let graphs = graphs();
        let options = SearchOptions {
            ngram_size: 2,
            ..SearchOptions::default()
        };

        let traces = find_traces(
            &graphs,
            &sequence(&["t/Util.a:()V", "t/Util.b:()V"]),
            &[],
            &options,
            &CommonObjectMethods,
        )
        .expect("traces");

        assert_eq!(2, traces.len());
        assert_eq!(vec!["t/Sample.run:()V,0", "t/Sample.run:()V,1"], locations(&traces[0]));
        assert_eq!(vec!["t/Sample.run:()V,2", "t/Sample.run:()V,3"], locations(&traces[1]));
    }

    #[test]
    fn find_traces_from_locations_uses_seeded_search() {
        let graphs = graphs();
        let options = SearchOptions {
            ngram_size: 2,
            ..SearchOptions::default()
        };
        let targets = parse_locations(&["t/Sample.run:()V,2"]).expect("parse");

        let traces = find_traces(
            &graphs,
            &sequence(&["t/Util.a:()V", "t/Util.b:()V"]),
            &targets,
            &options,
            &CommonObjectMethods,
        )
        .expect("traces");

        assert_eq!(1, traces.len());
        assert_eq!(vec!["t/Sample.run:()V,2", "t/Sample.run:()V,3"], locations(&traces[0]));
    }

    #[test]
    fn find_traces_rejects_unknown_methods() {
        let graphs = graphs();
        let targets = parse_locations(&["t/Missing.run:()V,0"]).expect("parse");

        let err = find_traces(
            &graphs,
            &sequence(&["t/Util.a:()V"]),
            &targets,
            &SearchOptions::default(),
            &CommonObjectMethods,
        )
        .expect_err("must fail");

        assert!(matches!(err, Error::UnknownMethod(_)));
    }

    fn step(label: &str, location: &str, depth: usize) -> GramStep {
        GramStep {
            label: label.to_string(),
            location: location.to_string(),
            depth,
        }
    }

    #[test]
    fn common_locations_intersect_every_trace() {
        let traces = vec![
            vec![step("a", "t/A.m:()V,0", 0), step("b", "t/B.n:()V,2", 1)],
            vec![step("a", "t/A.m:()V,0", 0), step("b", "t/A.m:()V,5", 0)],
        ];

        assert_eq!(BTreeSet::from(["t/A.m:()V,0"]), common_locations(&traces));
        assert!(common_locations(&[]).is_empty());
    }

    #[test]
    fn max_depth_falls_back_to_requested_locations() {
        let traces = vec![
            vec![step("a", "t/A.m:()V,0", 0), step("b", "t/B.n:()V,2", 2)],
            vec![step("a", "t/A.m:()V,3", 1), step("b", "t/A.m:()V,5", 0)],
        ];
        let none: &[&str] = &[];

        assert_eq!(2, max_depth(&traces, none));
        assert_eq!(3, max_depth(&[], &["t/A.m:()V,0 >1", "t/A.m:()V,4 >3", "t/A.m:()V,9"]));
        assert_eq!(0, max_depth(&[], none));
    }

    #[test]
    fn unique_method_count_ignores_repeated_callees() {
        let traces = vec![vec![
            step("a", "t/A.m:()V,0", 0),
            step("b", "t/A.m:()V,1", 0),
            step("a", "t/A.m:()V,2", 0),
        ]];

        assert_eq!(2, unique_method_count(&traces, &sequence(&["a", "b", "a"])));
        assert_eq!(3, unique_method_count(&[], &sequence(&["a", "b", "c"])));
    }
}
