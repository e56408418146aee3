use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use adalink_core::error::{ConstraintError, Error};
use adalink_core::types::{Command, Fnr, Isn};
use adalink_wire::{Buffer, BufferTag};

use crate::map::Map;
use crate::read::OPT_CONTINUE;
use crate::session::Session;

/// Record image width reserved for one map record; entry blobs are small.
const MAP_RECORD_CAPACITY: usize = 8192;

/// Name descriptor search: RN equals the padded map name.
const NAME_SEARCH: &str = "RN,32,A,EQ.";
const NAME_LEN: usize = 32;

/// A (target, file) pair holding persisted map definitions. Parsed maps
/// are cached by name; readers share the cache, modifications serialise
/// behind the writer lock.
pub struct MapRepository {
    target: String,
    fnr: Fnr,
    cache: RwLock<HashMap<String, Arc<Map>>>,
    /// Short name -> map names, for impact lookups when a file changes.
    reverse: RwLock<HashMap<String, Vec<String>>>,
    writer: Mutex<()>,
}

impl MapRepository {
    pub fn new(target: &str, fnr: Fnr) -> Self {
        MapRepository {
            target: target.to_string(),
            fnr,
            cache: RwLock::new(HashMap::new()),
            reverse: RwLock::new(HashMap::new()),
            writer: Mutex::new(()),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn fnr(&self) -> Fnr {
        self.fnr
    }

    /// Resolve a map by name: cache first, then a descriptor search (L9)
    /// for the record ISN and a direct read (L1) of the record.
    pub fn search(&self, session: &Session, name: &str) -> Result<Arc<Map>, Error> {
        if let Some(found) = self.cached(name) {
            return Ok(found);
        }
        let isn = self.find_isn(session, name)?;
        let map = self.fetch(session, isn)?;
        if map.name != name {
            return Err(ConstraintError::UnknownMap(name.to_string()).into());
        }
        Ok(self.install(map))
    }

    /// Maps that reference a short name, from the reverse index.
    pub fn maps_using(&self, short_name: &str) -> Vec<String> {
        self.reverse
            .read()
            .map(|index| index.get(short_name).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Validate and persist a new map. Fails on a name collision.
    pub fn add(&self, session: &Session, map: &mut Map) -> Result<(), Error> {
        let _writing = self.lock_writer();
        if self.cached(&map.name).is_some() {
            return Err(ConstraintError::DuplicateMap(map.name.clone()).into());
        }
        match self.find_isn(session, &map.name) {
            Ok(_) => {
                return Err(ConstraintError::DuplicateMap(map.name.clone()).into());
            }
            Err(Error::Constraint(ConstraintError::UnknownMap(_))) => {}
            Err(other) => return Err(other),
        }
        self.validate(session, map)?;
        let image = map.to_record_bytes();
        let mut buffers = vec![record_buffer(&image)?];
        let cid = session.allocate_command_id();
        let result = session.call(Command::N1, self.fnr, &mut buffers, |acbx| {
            acbx.command_id = cid;
        })?;
        session.end_transaction()?;
        map.isn = Some(result.isn);
        self.install(map.clone());
        log::debug!("map {} stored as isn {}", map.name, result.isn);
        Ok(())
    }

    /// Validate and overwrite a stored map in place.
    pub fn update(&self, session: &Session, map: &Map) -> Result<(), Error> {
        let _writing = self.lock_writer();
        let isn = map.isn.ok_or_else(|| ConstraintError::NotStored {
            map: map.name.clone(),
            operation: "update",
        })?;
        self.validate(session, map)?;
        let image = map.to_record_bytes();
        let mut buffers = vec![record_buffer(&image)?];
        let cid = session.allocate_command_id();
        session.call(Command::A1, self.fnr, &mut buffers, |acbx| {
            acbx.command_id = cid;
            acbx.isn = isn;
        })?;
        session.end_transaction()?;
        self.install(map.clone());
        Ok(())
    }

    /// Remove a map record and evict it from the cache.
    pub fn delete(&self, session: &Session, name: &str) -> Result<(), Error> {
        let _writing = self.lock_writer();
        let isn = match self.cached(name).and_then(|m| m.isn) {
            Some(isn) => isn,
            None => self.find_isn(session, name)?,
        };
        let cid = session.allocate_command_id();
        session.call(Command::E1, self.fnr, &mut [], |acbx| {
            acbx.command_id = cid;
            acbx.isn = isn;
        })?;
        session.end_transaction()?;
        self.evict(name);
        Ok(())
    }

    /// All maps in the repository file (L2 over the file), refreshing the
    /// cache as records stream in.
    pub fn list(&self, session: &Session) -> Result<Vec<Arc<Map>>, Error> {
        let cid = session.allocate_command_id();
        let mut maps = Vec::new();
        let mut first = true;
        loop {
            let mut buffers = vec![Buffer::with_capacity(
                BufferTag::Record,
                MAP_RECORD_CAPACITY,
            )];
            let continuation = !first;
            let result = session.call(Command::L2, self.fnr, &mut buffers, |acbx| {
                acbx.command_id = cid;
                if continuation {
                    acbx.set_option(OPT_CONTINUE, b'N');
                }
            })?;
            if result.is_eof() {
                break;
            }
            first = false;
            let mut map = Map::from_record_bytes(buffers[0].used_bytes())?;
            map.isn = Some(result.isn);
            maps.push(self.install(map));
        }
        Ok(maps)
    }

    /// Drop the cache and re-read every map from the file.
    pub fn reload(&self, session: &Session) -> Result<Vec<Arc<Map>>, Error> {
        if let Ok(mut cache) = self.cache.write() {
            cache.clear();
        }
        if let Ok(mut reverse) = self.reverse.write() {
            reverse.clear();
        }
        self.list(session)
    }

    fn cached(&self, name: &str) -> Option<Arc<Map>> {
        self.cache
            .read()
            .ok()
            .and_then(|cache| cache.get(name).cloned())
    }

    fn validate(&self, session: &Session, map: &Map) -> Result<(), Error> {
        let fdt = session.read_file_definition(map.fnr)?;
        map.validate(&fdt)
    }

    /// L9 over the RN descriptor: the reply ISN locates the record; EOF
    /// means no such map.
    fn find_isn(&self, session: &Session, name: &str) -> Result<Isn, Error> {
        let mut sb = Buffer::new(BufferTag::Search);
        sb.write_string(NAME_SEARCH)?;
        let mut vb = Buffer::new(BufferTag::Value);
        vb.write_bytes(&padded_name(name))?;
        let mut buffers = vec![sb, vb];
        let cid = session.allocate_command_id();
        let result = session.call(Command::L9, self.fnr, &mut buffers, |acbx| {
            acbx.command_id = cid;
        })?;
        if result.is_eof() || result.isn == Isn(0) {
            return Err(ConstraintError::UnknownMap(name.to_string()).into());
        }
        Ok(result.isn)
    }

    fn fetch(&self, session: &Session, isn: Isn) -> Result<Map, Error> {
        let mut buffers = vec![Buffer::with_capacity(
            BufferTag::Record,
            MAP_RECORD_CAPACITY,
        )];
        let cid = session.allocate_command_id();
        session.call(Command::L1, self.fnr, &mut buffers, |acbx| {
            acbx.command_id = cid;
            acbx.isn = isn;
        })?;
        let mut map = Map::from_record_bytes(buffers[0].used_bytes())?;
        map.isn = Some(isn);
        Ok(map)
    }

    fn install(&self, map: Map) -> Arc<Map> {
        let shared = Arc::new(map);
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(shared.name.clone(), Arc::clone(&shared));
        }
        if let Ok(mut reverse) = self.reverse.write() {
            for field in &shared.fields {
                let names = reverse.entry(field.short.to_string()).or_default();
                if !names.contains(&shared.name) {
                    names.push(shared.name.clone());
                }
            }
        }
        shared
    }

    fn evict(&self, name: &str) {
        if let Ok(mut cache) = self.cache.write() {
            cache.remove(name);
        }
        if let Ok(mut reverse) = self.reverse.write() {
            for names in reverse.values_mut() {
                names.retain(|n| n != name);
            }
            reverse.retain(|_, names| !names.is_empty());
        }
    }

    fn lock_writer(&self) -> std::sync::MutexGuard<'_, ()> {
        match self.writer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl std::fmt::Debug for MapRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapRepository")
            .field("target", &self.target)
            .field("fnr", &self.fnr)
            .finish()
    }
}

fn record_buffer(image: &[u8]) -> Result<Buffer, Error> {
    let mut rb = Buffer::new(BufferTag::Record);
    rb.write_bytes(image)?;
    Ok(rb)
}

fn padded_name(name: &str) -> Vec<u8> {
    let mut out = vec![b' '; NAME_LEN];
    let bytes = name.as_bytes();
    let n = bytes.len().min(NAME_LEN);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}
