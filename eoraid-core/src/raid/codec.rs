// vim: tw=80
//! The EvenOdd erasure code
//!
//! EvenOdd protects `ndata <= p` data columns, for some prime `p`, with two
//! redundancy columns.  P is the ordinary row parity.  E is the diagonal
//! parity, adjusted by the "S" diagonal.  Every sector is an independent code
//! word of `p - 1` rows, each row holding one element of `sector_size / (p -
//! 1)` bytes.  Row `p - 1` is imaginary and always zero, as are columns
//! `ndata` through `p - 1`.
//!
//! The code is linear, so redundancy may be updated from the XOR of old and
//! new data with the same functions that encode it.

use crate::{
    types::*,
    util::{is_prime, xor_into},
};

/// Selects one of the two redundancy columns
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Code {
    /// Row parity
    P,
    /// Diagonal parity
    E,
}

/// An encoder/decoder for EvenOdd
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EvenOdd {
    ndata: usize,
    prime: usize,
    sector_size: usize,
    /// Size of one element, in bytes
    elem: usize,
}

impl EvenOdd {
    /// Initialize a new EvenOdd codec
    ///
    /// # Parameters
    ///
    /// - `ndata`:          Number of data columns in the stripe.  May not
    ///                     exceed `prime`.
    /// - `prime`:          The code's prime.  Must be odd.
    /// - `sector_size`:    Size of one code word in bytes.  Must be a multiple
    ///                     of `prime - 1`.
    pub fn new(ndata: usize, prime: usize, sector_size: usize) -> Result<Self> {
        if prime < 3 || !is_prime(prime) {
            return Err(Error::InvalidConfig("prime must be an odd prime"));
        }
        if ndata < 1 || ndata > prime {
            return Err(Error::InvalidConfig("ndata may not exceed the prime"));
        }
        if sector_size == 0 || sector_size % (prime - 1) != 0 {
            return Err(Error::InvalidConfig(
                "bytes_per_sector must be a multiple of prime - 1"));
        }
        let elem = sector_size / (prime - 1);
        Ok(EvenOdd{ndata, prime, sector_size, elem})
    }

    pub fn ndata(&self) -> usize {
        self.ndata
    }

    pub fn prime(&self) -> usize {
        self.prime
    }

    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn check_len(&self, len: usize) {
        assert_eq!(len % self.sector_size, 0,
            "buffer is not a whole number of code words");
    }

    /// Encode one redundancy column from all of the data columns.
    ///
    /// Every data column must have the same length as `out`.
    pub fn encode(&self, code: Code, data: &[&[u8]], out: &mut [u8]) {
        assert_eq!(data.len(), self.ndata);
        out.fill(0);
        for (col, d) in data.iter().enumerate() {
            self.encode_col(code, col, d, out);
        }
    }

    /// Compute P, the bytewise XOR of all data columns
    pub fn encode_p(&self, data: &[&[u8]], p: &mut [u8]) {
        self.encode(Code::P, data, p)
    }

    /// Compute E, the adjusted diagonal parity of all data columns
    pub fn encode_e(&self, data: &[&[u8]], e: &mut [u8]) {
        self.encode(Code::E, data, e)
    }

    /// Accumulate one data column's contribution into a redundancy column.
    ///
    /// `src` may be either a column's contents or the XOR of its old and new
    /// contents.  In the latter case, `dst` is updated in place.
    pub fn encode_col(&self, code: Code, col: usize, src: &[u8],
                      dst: &mut [u8])
    {
        match code {
            Code::P => xor_into(dst, src),
            Code::E => self.encode_e_col(col, src, dst)
        }
    }

    /// Accumulate one data column's contribution into E.
    pub fn encode_e_col(&self, col: usize, src: &[u8], e: &mut [u8]) {
        assert!(col < self.ndata, "column out of range");
        assert_eq!(src.len(), e.len());
        self.check_len(src.len());
        let p = self.prime;
        let el = self.elem;
        let words = src.chunks_exact(self.sector_size)
            .zip(e.chunks_exact_mut(self.sector_size));
        for (s, es) in words {
            for r in 0..p - 1 {
                let a = &s[r * el..(r + 1) * el];
                let d = (r + col) % p;
                if d == p - 1 {
                    // Part of the S diagonal, which adjusts every row
                    for row in es.chunks_exact_mut(el) {
                        xor_into(row, a);
                    }
                } else {
                    xor_into(&mut es[d * el..(d + 1) * el], a);
                }
            }
        }
    }

    /// Reconstruct one missing data column from the other data columns and
    /// one redundancy column.
    ///
    /// # Parameters
    ///
    /// - `code`:       Which redundancy column `red` holds
    /// - `missing`:    Index of the column to reconstruct
    /// - `data`:       Every data column, with `None` at `missing`
    /// - `red`:        The P or E column
    /// - `out`:        Storage for the reconstructed column
    pub fn decode_one(&self, code: Code, missing: usize,
                      data: &[Option<&[u8]>], red: &[u8], out: &mut [u8])
    {
        assert_eq!(data.len(), self.ndata);
        assert!(data[missing].is_none());
        self.check_len(out.len());
        out.copy_from_slice(red);
        for (col, d) in data.iter().enumerate() {
            if let Some(d) = d {
                self.encode_col(code, col, d, out);
            }
        }
        // For P we're done.  For E, out now holds only column `missing`'s
        // contribution to each diagonal, still adjusted by its S element.
        if code == Code::E && missing > 0 {
            let p = self.prime;
            let el = self.elem;
            let mut t = vec![0u8; self.sector_size];
            for os in out.chunks_exact_mut(self.sector_size) {
                t.copy_from_slice(os);
                let s = &t[(missing - 1) * el..missing * el];
                for r in 0..p - 1 {
                    let o = &mut os[r * el..(r + 1) * el];
                    if r == p - 1 - missing {
                        o.copy_from_slice(s);
                    } else {
                        let d = (r + missing) % p;
                        o.copy_from_slice(&t[d * el..(d + 1) * el]);
                        xor_into(o, s);
                    }
                }
            }
        }
    }

    /// Reconstruct two missing data columns from the rest of the stripe.
    ///
    /// First recover the S diagonal from both redundancy columns, then walk
    /// the chain of diagonals and rows that starts at the imaginary row.
    ///
    /// # Parameters
    ///
    /// - `missing`:    Indices of the two columns to reconstruct.  The first
    ///                 must be lower.
    /// - `data`:       Every data column, with `None` at both missing indices
    /// - `p`, `e`:     The redundancy columns
    /// - `out_i`, `out_j`: Storage for the reconstructed columns
    pub fn decode_two(&self, missing: (usize, usize), data: &[Option<&[u8]>],
                      p: &[u8], e: &[u8], out_i: &mut [u8], out_j: &mut [u8])
    {
        let (i, j) = missing;
        assert!(i < j && j < self.ndata, "invalid pair of missing columns");
        assert_eq!(data.len(), self.ndata);
        assert!(data[i].is_none() && data[j].is_none());
        self.check_len(p.len());
        let prime = self.prime;
        let el = self.elem;
        let ss = self.sector_size;

        // u = a_i ^ a_j, row by row
        let mut u = p.to_vec();
        // v = the diagonal contributions of a_i and a_j
        let mut v = e.to_vec();
        for (col, d) in data.iter().enumerate() {
            if let Some(d) = d {
                xor_into(&mut u, d);
                self.encode_e_col(col, d, &mut v);
            }
        }

        let delta = j - i;
        let mut w = vec![0u8; prime * el];
        let mut ai = vec![0u8; prime * el];
        let mut aj = vec![0u8; prime * el];
        let mut s = vec![0u8; el];
        for (sector, (us, vs)) in u.chunks_exact(ss)
            .zip(v.chunks_exact(ss))
            .enumerate()
        {
            s.fill(0);
            for row in us.chunks_exact(el).chain(vs.chunks_exact(el)) {
                xor_into(&mut s, row);
            }
            w[..ss].copy_from_slice(vs);
            for row in w[..ss].chunks_exact_mut(el) {
                xor_into(row, &s);
            }
            w[ss..].copy_from_slice(&s);
            ai.fill(0);
            aj.fill(0);

            let mut r = prime - 1 - delta;
            while r != prime - 1 {
                let d = (r + j) % prime;
                let ri = (r + delta) % prime;
                let (lo, hi) = (r * el, (r + 1) * el);
                aj[lo..hi].copy_from_slice(&w[d * el..(d + 1) * el]);
                xor_into(&mut aj[lo..hi], &ai[ri * el..(ri + 1) * el]);
                ai[lo..hi].copy_from_slice(&us[lo..hi]);
                xor_into(&mut ai[lo..hi], &aj[lo..hi]);
                r = (r + prime - delta) % prime;
            }
            let range = sector * ss..(sector + 1) * ss;
            out_i[range.clone()].copy_from_slice(&ai[..ss]);
            out_j[range].copy_from_slice(&aj[..ss]);
        }
    }

    /// Check whether P and E are consistent with the data columns.
    pub fn verify(&self, data: &[&[u8]], p: &[u8], e: &[u8]) -> bool {
        let mut scratch = vec![0u8; p.len()];
        self.encode_p(data, &mut scratch);
        if scratch != p {
            return false;
        }
        self.encode_e(data, &mut scratch);
        scratch == e
    }
}

// LCOV_EXCL_STOP
