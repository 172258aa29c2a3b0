use std::{collections::HashMap, sync::Arc};

use thiserror::Error;

/// Pares (key, value) que emite un kernel.
pub type Output = Vec<(String, String)>;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("record {0:?} has no query time")]
    BadRecord(String),

    #[error("value {0:?} is not a number")]
    NotANumber(String),
}

/// Lógica de usuario del lado map: key = nombre del archivo, value = una línea.
pub trait Mapper: Send + Sync {
    fn map(&self, key: &str, value: &str, output: &mut Output) -> Result<(), KernelError>;
}

/// Lógica de usuario del lado reduce: todos los valores de una key.
pub trait Reducer: Send + Sync {
    fn reduce(&self, key: &str, values: &[String], output: &mut Output)
        -> Result<(), KernelError>;
}

/// Kernels registrados por nombre. El submit valida contra esto.
#[derive(Clone, Default)]
pub struct KernelRegistry {
    mappers: HashMap<String, Arc<dyn Mapper>>,
    reducers: HashMap<String, Arc<dyn Reducer>>,
}

impl std::fmt::Debug for KernelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut mappers: Vec<&String> = self.mappers.keys().collect();
        let mut reducers: Vec<&String> = self.reducers.keys().collect();
        mappers.sort();
        reducers.sort();
        f.debug_struct("KernelRegistry")
            .field("mappers", &mappers)
            .field("reducers", &reducers)
            .finish()
    }
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `word_count` y `average_query_time`.
    pub fn builtin() -> Self {
        let mut reg = Self::new();
        reg.register_mapper("word_count", WordCount);
        reg.register_reducer("word_count", WordCount);
        reg.register_mapper("average_query_time", AverageQueryTime);
        reg.register_reducer("average_query_time", AverageQueryTime);
        reg
    }

    pub fn register_mapper(&mut self, name: impl Into<String>, mapper: impl Mapper + 'static) {
        self.mappers.insert(name.into(), Arc::new(mapper));
    }

    pub fn register_reducer(&mut self, name: impl Into<String>, reducer: impl Reducer + 'static) {
        self.reducers.insert(name.into(), Arc::new(reducer));
    }

    pub fn mapper(&self, name: &str) -> Option<Arc<dyn Mapper>> {
        self.mappers.get(name).cloned()
    }

    pub fn reducer(&self, name: &str) -> Option<Arc<dyn Reducer>> {
        self.reducers.get(name).cloned()
    }

    pub fn has_mapper(&self, name: &str) -> bool {
        self.mappers.contains_key(name)
    }

    pub fn has_reducer(&self, name: &str) -> bool {
        self.reducers.contains_key(name)
    }
}

/// Cuenta palabras separadas por espacios.
#[derive(Debug, Clone, Copy)]
pub struct WordCount;

impl Mapper for WordCount {
    fn map(&self, _key: &str, value: &str, output: &mut Output) -> Result<(), KernelError> {
        for word in value.split_whitespace() {
            output.push((word.to_string(), "1".to_string()));
        }
        Ok(())
    }
}

impl Reducer for WordCount {
    fn reduce(&self, key: &str, values: &[String], output: &mut Output) -> Result<(), KernelError> {
        let mut sum: i64 = 0;
        for v in values {
            sum += v
                .trim()
                .parse::<i64>()
                .map_err(|_| KernelError::NotANumber(v.clone()))?;
        }
        output.push((key.to_string(), sum.to_string()));
        Ok(())
    }
}

/// Promedio de tiempos de query de un log: el segundo campo es `(segundos)`.
#[derive(Debug, Clone, Copy)]
pub struct AverageQueryTime;

impl Mapper for AverageQueryTime {
    fn map(&self, _key: &str, value: &str, output: &mut Output) -> Result<(), KernelError> {
        let field = value
            .split_whitespace()
            .nth(1)
            .ok_or_else(|| KernelError::BadRecord(value.to_string()))?;
        let inner = field
            .strip_prefix('(')
            .and_then(|f| f.strip_suffix(')'))
            .ok_or_else(|| KernelError::BadRecord(value.to_string()))?;
        let time: f64 = inner
            .parse()
            .map_err(|_| KernelError::NotANumber(inner.to_string()))?;
        output.push(("avg".to_string(), time.to_string()));
        Ok(())
    }
}

impl Reducer for AverageQueryTime {
    fn reduce(&self, key: &str, values: &[String], output: &mut Output) -> Result<(), KernelError> {
        if values.is_empty() {
            return Ok(());
        }
        let mut sum = 0.0f64;
        for v in values {
            sum += v
                .trim()
                .parse::<f64>()
                .map_err(|_| KernelError::NotANumber(v.clone()))?;
        }
        output.push((key.to_string(), (sum / values.len() as f64).to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_knows_both_kernels() {
        let reg = KernelRegistry::builtin();
        for name in ["word_count", "average_query_time"] {
            assert!(reg.has_mapper(name));
            assert!(reg.has_reducer(name));
        }
        assert!(!reg.has_mapper("grep"));
        assert!(reg.reducer("grep").is_none());
    }

    #[test]
    fn word_count_emits_one_per_word_and_sums() {
        let mut out = Output::new();
        WordCount.map("input.txt", "the cat  sat\n", &mut out).unwrap();
        assert_eq!(
            out,
            vec![
                ("the".to_string(), "1".to_string()),
                ("cat".to_string(), "1".to_string()),
                ("sat".to_string(), "1".to_string()),
            ]
        );

        let mut reduced = Output::new();
        let ones = vec!["1".to_string(), "1".to_string(), "3".to_string()];
        WordCount.reduce("the", &ones, &mut reduced).unwrap();
        assert_eq!(reduced, vec![("the".to_string(), "5".to_string())]);
    }

    #[test]
    fn word_count_reduce_rejects_garbage() {
        let mut out = Output::new();
        let err = WordCount
            .reduce("the", &["uno".to_string()], &mut out)
            .unwrap_err();
        assert!(matches!(err, KernelError::NotANumber(_)));
    }

    #[test]
    fn average_query_time_parses_and_averages() {
        let mut out = Output::new();
        AverageQueryTime
            .map("db.log", "SELECT (0.500) rows=3", &mut out)
            .unwrap();
        AverageQueryTime
            .map("db.log", "UPDATE (1.500) rows=1", &mut out)
            .unwrap();
        assert_eq!(out[0], ("avg".to_string(), "0.5".to_string()));

        let values: Vec<String> = out.into_iter().map(|(_, v)| v).collect();
        let mut reduced = Output::new();
        AverageQueryTime.reduce("avg", &values, &mut reduced).unwrap();
        assert_eq!(reduced, vec![("avg".to_string(), "1".to_string())]);
    }

    #[test]
    fn average_query_time_rejects_lines_without_time() {
        let mut out = Output::new();
        let err = AverageQueryTime.map("db.log", "SELECT", &mut out).unwrap_err();
        assert!(matches!(err, KernelError::BadRecord(_)));
    }
}
