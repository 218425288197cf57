use std::io;

#[derive(Clone, Debug)]
pub struct Config {
    value: toml::Value,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            value: toml::Value::Table(toml::map::Map::new()),
        }
    }
}

impl Config {
    /// Get an entry by path. If the input argument contains dots, the path is split
    /// into keys, each key being requested recursively.
    pub fn get<T: AsRef<str>>(&self, k: T) -> Option<&str> {
        self.lookup(k.as_ref())?.as_str()
    }

    /// Get an entry of type integer by path
    pub fn get_usize<T: AsRef<str>>(&self, k: T) -> Option<usize> {
        self.lookup(k.as_ref())?
            .as_integer()
            .and_then(|i| if i >= 0 { Some(i as usize) } else { None })
    }

    /// Get an entry of type boolean by path
    pub fn get_bool<T: AsRef<str>>(&self, k: T) -> Option<bool> {
        self.lookup(k.as_ref())?.as_bool()
    }

    /// Set an entry by path, creating intermediate tables if needed.
    /// Existing values are overwritten.
    pub fn set<T: AsRef<str>, V: Into<toml::Value>>(&mut self, k: T, v: V) -> bool {
        let keys: Vec<&str> = k.as_ref().split('.').collect();
        let (last, path) = match keys.split_last() {
            Some(x) => x,
            None => return false,
        };
        let mut item = &mut self.value;
        for key in path {
            let table = match item.as_table_mut() {
                Some(t) => t,
                None => return false,
            };
            item = table
                .entry(key.to_string())
                .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
        }
        match item.as_table_mut() {
            Some(t) => {
                t.insert(last.to_string(), v.into());
                true
            }
            None => false,
        }
    }

    /// Load configuration from input object. If keys are already present, they are overwritten
    pub fn load_config<R: io::Read>(&mut self, mut config: R) -> Result<(), io::Error> {
        let mut s = String::new();
        config.read_to_string(&mut s)?;
        match toml::from_str::<toml::Table>(&s) {
            Ok(table) => {
                self.value = toml::Value::Table(table);
                Ok(())
            }
            _ => Err(io::Error::new(
                io::ErrorKind::Other,
                "Load configuration failed",
            )),
        }
    }

    fn lookup(&self, k: &str) -> Option<&toml::Value> {
        let mut item = &self.value;
        for key in k.split('.') {
            item = item.get(key)?;
        }
        Some(item)
    }
}
