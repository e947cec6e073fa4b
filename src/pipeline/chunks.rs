//! Date-range chunking and chunk concatenation

use crate::error::{PipelineError, Result};
use crate::pipeline::array::union_categories;
use crate::pipeline::output::{OutputColumn, PipelineOutput};
use chrono::NaiveDate;
use hashbrown::HashMap;

/// Split `sessions` into contiguous `(first, last)` ranges of at most
/// `chunksize` sessions
pub fn compute_date_range_chunks(sessions: &[NaiveDate], chunksize: usize) -> Vec<(NaiveDate, NaiveDate)> {
    sessions
        .chunks(chunksize.max(1))
        .filter_map(|chunk| Some((*chunk.first()?, *chunk.last()?)))
        .collect()
}

/// Concatenate chunk outputs in order
///
/// Categorical columns are re-expressed over the union of the categories
/// seen in every chunk before their codes are appended. A single chunk is
/// returned as is.
pub fn concat_outputs(mut chunks: Vec<PipelineOutput>) -> Result<PipelineOutput> {
    if chunks.len() <= 1 {
        return chunks
            .pop()
            .ok_or_else(|| PipelineError::InvalidInput("No chunks to concatenate".to_string()));
    }

    let names: Vec<String> = chunks[0].column_names().iter().map(|n| n.to_string()).collect();
    for chunk in &chunks[1..] {
        if chunk.column_names() != names.iter().map(String::as_str).collect::<Vec<_>>() {
            return Err(PipelineError::InvalidInput(
                "Chunks disagree on their columns".to_string(),
            ));
        }
    }

    let mut unions: HashMap<usize, Vec<String>> = HashMap::new();
    for (i, (_, column)) in chunks[0].columns().iter().enumerate() {
        if let OutputColumn::Categorical { .. } = column {
            let mut sets = Vec::with_capacity(chunks.len());
            for chunk in &chunks {
                match &chunk.columns()[i].1 {
                    OutputColumn::Categorical { categories, .. } => sets.push(categories.as_slice()),
                    _ => {
                        return Err(PipelineError::TypeMismatch(format!(
                            "Column {} changes kind between chunks",
                            names[i]
                        )))
                    }
                }
            }
            unions.insert(i, union_categories(sets)?);
        }
    }

    let total: usize = chunks.iter().map(|c| c.len()).sum();
    let mut dates = Vec::with_capacity(total);
    let mut sids = Vec::with_capacity(total);
    let mut columns: Vec<(String, OutputColumn)> = Vec::with_capacity(names.len());

    for chunk in chunks {
        let (chunk_dates, chunk_sids, chunk_columns) = chunk.into_parts();
        dates.extend(chunk_dates);
        sids.extend(chunk_sids);
        for (i, (name, column)) in chunk_columns.into_iter().enumerate() {
            if columns.len() <= i {
                let empty = match unions.get(&i) {
                    Some(union) => OutputColumn::Categorical {
                        codes: Vec::with_capacity(total),
                        categories: union.clone(),
                    },
                    None => OutputColumn::empty(column.kind(), Vec::new()),
                };
                columns.push((name, empty));
            }
            append(&mut columns[i].1, column, &names[i])?;
        }
    }

    PipelineOutput::new(dates, sids, columns)
}

fn append(target: &mut OutputColumn, source: OutputColumn, name: &str) -> Result<()> {
    match (target, source) {
        (OutputColumn::Numeric(t), OutputColumn::Numeric(s)) => t.extend(s),
        (OutputColumn::Boolean(t), OutputColumn::Boolean(s)) => t.extend(s),
        (
            OutputColumn::Categorical { codes, categories },
            OutputColumn::Categorical {
                codes: source_codes,
                categories: source_categories,
            },
        ) => {
            let position: HashMap<&str, u32> = categories
                .iter()
                .enumerate()
                .map(|(i, c)| (c.as_str(), i as u32))
                .collect();
            let mapping = source_categories
                .iter()
                .map(|c| {
                    position.get(c.as_str()).copied().ok_or_else(|| {
                        PipelineError::TypeMismatch(format!("Category '{}' of {} missing from union", c, name))
                    })
                })
                .collect::<Result<Vec<u32>>>()?;
            codes.extend(source_codes.into_iter().map(|c| mapping[c as usize]));
        }
        _ => {
            return Err(PipelineError::TypeMismatch(format!(
                "Column {} changes kind between chunks",
                name
            )))
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2021, 1, day).unwrap()
    }

    fn labels(day: u32, codes: Vec<u32>, categories: &[&str]) -> PipelineOutput {
        let n = codes.len();
        PipelineOutput::new(
            vec![d(day); n],
            (1..=n as u64).collect(),
            vec![(
                "sector".to_string(),
                OutputColumn::Categorical {
                    codes,
                    categories: categories.iter().map(|c| c.to_string()).collect(),
                },
            )],
        )
        .unwrap()
    }

    #[test]
    fn test_chunks_cover_range() {
        let sessions: Vec<NaiveDate> = [4, 5, 6, 7, 8].iter().map(|x| d(*x)).collect();
        assert_eq!(
            compute_date_range_chunks(&sessions, 2),
            vec![(d(4), d(5)), (d(6), d(7)), (d(8), d(8))]
        );
        assert_eq!(compute_date_range_chunks(&sessions, 10), vec![(d(4), d(8))]);
        assert!(compute_date_range_chunks(&[], 10).is_empty());
    }

    #[test]
    fn test_categorical_union_keeps_every_level() {
        let first = labels(4, vec![1, 0], &["NA", "Energy"]);
        let second = labels(5, vec![2, 1], &["NA", "Technology", "Utilities"]);
        let out = concat_outputs(vec![first, second]).unwrap();

        assert_eq!(out.len(), 4);
        assert_eq!(out.get_label(d(4), 1, "sector"), Some("Energy"));
        assert_eq!(out.get_label(d(4), 2, "sector"), Some("NA"));
        assert_eq!(out.get_label(d(5), 1, "sector"), Some("Utilities"));
        assert_eq!(out.get_label(d(5), 2, "sector"), Some("Technology"));
        match out.column("sector").unwrap() {
            OutputColumn::Categorical { categories, .. } => {
                assert_eq!(categories, &vec!["NA", "Energy", "Technology", "Utilities"]);
            }
            other => panic!("unexpected column {:?}", other),
        }
    }

    #[test]
    fn test_single_chunk_passes_through() {
        let only = labels(4, vec![1], &["NA", "Energy"]);
        let out = concat_outputs(vec![only.clone()]).unwrap();
        assert_eq!(out, only);
    }

    #[test]
    fn test_mismatched_columns_rejected() {
        let a = labels(4, vec![1], &["NA", "Energy"]);
        let b = PipelineOutput::new(
            vec![d(5)],
            vec![1],
            vec![("other".to_string(), OutputColumn::Numeric(vec![1.0]))],
        )
        .unwrap();
        assert!(concat_outputs(vec![a, b]).is_err());
    }
}
