//! Flattened device tree reader and writer.
//!
//! Only what kexec needs: the full tree is read into memory, edited, and
//! written back out as a version 17 blob.

use core::fmt;

use crate::error::{Error, Result};

pub const MAGIC: u32 = 0xd00d_feed;

const HEADER_SIZE: usize = 40;
const VERSION: u32 = 17;
const LAST_COMP_VERSION: u32 = 16;

const FDT_BEGIN_NODE: u32 = 1;
const FDT_END_NODE: u32 = 2;
const FDT_PROP: u32 = 3;
const FDT_NOP: u32 = 4;
const FDT_END: u32 = 9;

#[derive(Clone, PartialEq, Eq)]
pub struct Property {
    pub name: String,
    pub value: Vec<u8>,
}

impl Property {
    pub fn new(name: &str, value: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    pub fn u64(name: &str, v: u64) -> Self {
        Self::new(name, v.to_be_bytes().to_vec())
    }

    /// A NUL-terminated string.
    pub fn string(name: &str, s: &str) -> Self {
        let mut value = s.as_bytes().to_vec();
        value.push(0);
        Self::new(name, value)
    }

    pub fn as_u32(&self) -> Option<u32> {
        Some(u32::from_be_bytes(self.value.as_slice().try_into().ok()?))
    }

    pub fn as_u64(&self) -> Option<u64> {
        Some(u64::from_be_bytes(self.value.as_slice().try_into().ok()?))
    }

    pub fn as_str(&self) -> Option<&str> {
        let s = self.value.strip_suffix(&[0])?;
        core::str::from_utf8(s).ok()
    }
}

impl fmt::Debug for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_str() {
            Some(s) if !s.is_empty() => write!(f, "{} = {s:?}", self.name),
            _ => write!(f, "{} = {:02x?}", self.name, self.value),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub properties: Vec<Property>,
    pub children: Vec<Node>,
}

impl Node {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Adds `p` or replaces the property of the same name.
    pub fn set_property(&mut self, p: Property) {
        match self.properties.iter_mut().find(|old| old.name == p.name) {
            Some(old) => *old = p,
            None => self.properties.push(p),
        }
    }

    pub fn remove_property(&mut self, name: &str) -> Option<Property> {
        let i = self.properties.iter().position(|p| p.name == name)?;
        Some(self.properties.remove(i))
    }

    pub fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.children.iter_mut().find(|c| c.name == name)
    }

    /// Calls `f` on this node and every descendant, depth first.
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a Node)) {
        f(self);
        for c in &self.children {
            c.walk(f);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReserveEntry {
    pub address: u64,
    pub size: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Fdt {
    pub boot_cpuid_phys: u32,
    pub reserve_entries: Vec<ReserveEntry>,
    pub root: Node,
}

fn fdt_err(msg: impl Into<String>) -> Error {
    Error::Fdt(msg.into())
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let b = self
            .data
            .get(self.pos..self.pos + n)
            .ok_or_else(|| fdt_err(format!("truncated at {:#x}", self.pos)))?;
        self.pos += n;
        Ok(b)
    }

    fn u32(&mut self) -> Result<u32> {
        let mut w = [0; 4];
        w.copy_from_slice(self.bytes(4)?);
        Ok(u32::from_be_bytes(w))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut w = [0; 8];
        w.copy_from_slice(self.bytes(8)?);
        Ok(u64::from_be_bytes(w))
    }

    fn align4(&mut self) {
        self.pos = (self.pos + 3) & !3;
    }

    fn cstr(&mut self) -> Result<&'a str> {
        let rest = self.data.get(self.pos..).unwrap_or_default();
        let len = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| fdt_err("unterminated string"))?;
        let s = core::str::from_utf8(&rest[..len]).map_err(|e| fdt_err(e.to_string()))?;
        self.pos += len + 1;
        Ok(s)
    }

    /// Next token, skipping `FDT_NOP`.
    fn token(&mut self) -> Result<u32> {
        loop {
            match self.u32()? {
                FDT_NOP => continue,
                t => return Ok(t),
            }
        }
    }
}

fn string_at(strings: &[u8], off: usize) -> Result<String> {
    let rest = strings
        .get(off..)
        .ok_or_else(|| fdt_err(format!("string offset {off:#x} out of range")))?;
    let len = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| fdt_err("unterminated property name"))?;
    String::from_utf8(rest[..len].to_vec()).map_err(|e| fdt_err(e.to_string()))
}

/// Body of a node whose `FDT_BEGIN_NODE` token was just consumed.
fn read_node(r: &mut Reader<'_>, strings: &[u8], depth: usize) -> Result<Node> {
    if depth > 64 {
        return Err(fdt_err("nodes nested too deeply"));
    }
    let mut node = Node::new(r.cstr()?);
    r.align4();
    loop {
        match r.token()? {
            FDT_PROP => {
                let len = r.u32()? as usize;
                let name = string_at(strings, r.u32()? as usize)?;
                let value = r.bytes(len)?.to_vec();
                r.align4();
                node.properties.push(Property { name, value });
            }
            FDT_BEGIN_NODE => node.children.push(read_node(r, strings, depth + 1)?),
            FDT_END_NODE => return Ok(node),
            t => return Err(fdt_err(format!("unexpected token {t:#x} in {}", node.name))),
        }
    }
}

impl Fdt {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut h = Reader { data, pos: 0 };
        let magic = h.u32()?;
        if magic != MAGIC {
            return Err(Error::BadMagic {
                expected: MAGIC as u64,
                found: magic as u64,
            });
        }
        let totalsize = h.u32()? as usize;
        let off_struct = h.u32()? as usize;
        let off_strings = h.u32()? as usize;
        let off_rsvmap = h.u32()? as usize;
        let version = h.u32()?;
        let _last_comp = h.u32()?;
        let boot_cpuid_phys = h.u32()?;
        let size_strings = h.u32()? as usize;
        if version < LAST_COMP_VERSION {
            return Err(fdt_err(format!("version {version} is too old")));
        }
        let data = data
            .get(..totalsize)
            .ok_or_else(|| fdt_err("blob shorter than its header says"))?;
        let strings = data
            .get(off_strings..off_strings + size_strings)
            .ok_or_else(|| fdt_err("strings block out of range"))?;

        let mut r = Reader {
            data,
            pos: off_rsvmap,
        };
        let mut reserve_entries = Vec::new();
        loop {
            let address = r.u64()?;
            let size = r.u64()?;
            if address == 0 && size == 0 {
                break;
            }
            reserve_entries.push(ReserveEntry { address, size });
        }

        let mut r = Reader {
            data,
            pos: off_struct,
        };
        if r.token()? != FDT_BEGIN_NODE {
            return Err(fdt_err("structure block does not start with a node"));
        }
        let root = read_node(&mut r, strings, 0)?;
        if r.token()? != FDT_END {
            return Err(fdt_err("missing end token"));
        }
        Ok(Self {
            boot_cpuid_phys,
            reserve_entries,
            root,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut strings: Vec<u8> = Vec::new();
        let mut st = Vec::new();
        write_node(&self.root, &mut st, &mut strings);
        st.extend_from_slice(&FDT_END.to_be_bytes());

        let mut rsv = Vec::new();
        for e in self
            .reserve_entries
            .iter()
            .chain([&ReserveEntry { address: 0, size: 0 }])
        {
            rsv.extend_from_slice(&e.address.to_be_bytes());
            rsv.extend_from_slice(&e.size.to_be_bytes());
        }

        let off_rsvmap = HEADER_SIZE;
        let off_struct = off_rsvmap + rsv.len();
        let off_strings = off_struct + st.len();
        let total = off_strings + strings.len();

        let mut out = Vec::with_capacity(total);
        for w in [
            MAGIC,
            total as u32,
            off_struct as u32,
            off_strings as u32,
            off_rsvmap as u32,
            VERSION,
            LAST_COMP_VERSION,
            self.boot_cpuid_phys,
            strings.len() as u32,
            st.len() as u32,
        ] {
            out.extend_from_slice(&w.to_be_bytes());
        }
        out.extend_from_slice(&rsv);
        out.extend_from_slice(&st);
        out.extend_from_slice(&strings);
        out
    }

    /// Node at an absolute path such as `/chosen`.
    pub fn node(&self, path: &str) -> Option<&Node> {
        path.split('/')
            .filter(|c| !c.is_empty())
            .try_fold(&self.root, |n, c| n.child(c))
    }

    pub fn node_mut(&mut self, path: &str) -> Option<&mut Node> {
        path.split('/')
            .filter(|c| !c.is_empty())
            .try_fold(&mut self.root, |n, c| n.child_mut(c))
    }
}

fn pad4(buf: &mut Vec<u8>) {
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

fn name_offset(strings: &mut Vec<u8>, name: &str) -> u32 {
    let mut needle = name.as_bytes().to_vec();
    needle.push(0);
    if let Some(off) = strings
        .windows(needle.len())
        .enumerate()
        .position(|(i, w)| w == needle.as_slice() && (i == 0 || strings[i - 1] == 0))
    {
        return off as u32;
    }
    let off = strings.len() as u32;
    strings.extend_from_slice(&needle);
    off
}

fn write_node(node: &Node, st: &mut Vec<u8>, strings: &mut Vec<u8>) {
    st.extend_from_slice(&FDT_BEGIN_NODE.to_be_bytes());
    st.extend_from_slice(node.name.as_bytes());
    st.push(0);
    pad4(st);
    for p in &node.properties {
        st.extend_from_slice(&FDT_PROP.to_be_bytes());
        st.extend_from_slice(&(p.value.len() as u32).to_be_bytes());
        st.extend_from_slice(&name_offset(strings, &p.name).to_be_bytes());
        st.extend_from_slice(&p.value);
        pad4(st);
    }
    for c in &node.children {
        write_node(c, st, strings);
    }
    st.extend_from_slice(&FDT_END_NODE.to_be_bytes());
}
