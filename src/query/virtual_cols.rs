//! Hook for virtual columns: default values for columns the CSV lacks.
//!
//! Schema loading lives with the caller; the core only extends a header
//! map with synthetic trailing columns and hands back the defaults that
//! get appended to every materialized row.

use ahash::AHashMap;

#[derive(Debug, Default, Clone)]
pub struct VirtualColumns {
    cols: Vec<(String, String)>,
}

impl VirtualColumns {
    /// `pairs` of (column name, default value); ordered by name so the
    /// synthetic column positions are stable.
    pub fn new(mut pairs: Vec<(String, String)>) -> Self {
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        Self { cols: pairs }
    }

    pub fn is_empty(&self) -> bool {
        self.cols.is_empty()
    }

    /// Register the virtual columns after the real header columns and
    /// return the default values to append to each row, in position order.
    /// Names already present in the header are skipped.
    pub fn extend_header_map(&self, header_map: &mut AHashMap<String, usize>) -> Vec<String> {
        let mut next = header_map.len();
        let mut defaults = Vec::new();
        for (name, default) in &self.cols {
            let key = name.to_lowercase();
            if !header_map.contains_key(key.as_str()) {
                header_map.insert(key, next);
                next += 1;
                defaults.push(default.clone());
            }
        }
        defaults
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extend_header_map() {
        let mut map: AHashMap<String, usize> =
            [("id".to_string(), 0), ("dept".to_string(), 1)].into_iter().collect();
        let virt = VirtualColumns::new(vec![
            ("region".to_string(), "EU".to_string()),
            ("active".to_string(), "yes".to_string()),
            ("dept".to_string(), "ignored".to_string()),
        ]);
        let defaults = virt.extend_header_map(&mut map);

        // existing column untouched, new ones appended sorted by name
        assert_eq!(map["dept"], 1);
        assert_eq!(map["active"], 2);
        assert_eq!(map["region"], 3);
        assert_eq!(defaults, vec!["yes".to_string(), "EU".to_string()]);
    }

    #[test]
    fn test_empty() {
        assert!(VirtualColumns::default().is_empty());
    }
}
